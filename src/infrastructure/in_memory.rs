use crate::domain::account::{Account, AccountId, Amount, Energy};
use crate::domain::consumption::{ConsumptionEvent, IdempotencyKey, NewConsumption};
use crate::domain::ports::{LedgerStore, UnitOfWork};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// A thread-safe in-memory ledger store.
///
/// Each account row carries its own `tokio::sync::Mutex`, held by a unit of
/// work from `lock_account` until commit or drop. Idempotency keys get the
/// same treatment so that a second insert of a key waits for the first
/// unit of work to finish before deciding whether it is a duplicate.
///
/// Cloning shares the underlying tables.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    inner: Arc<Tables>,
    lock_timeout: Option<Duration>,
}

#[derive(Default)]
struct Tables {
    accounts: RwLock<HashMap<AccountId, Arc<Row>>>,
    events: RwLock<EventTable>,
    // Only touched without awaiting, so a blocking mutex is enough. Entries
    // live while some unit of work holds or waits for the key.
    key_locks: std::sync::Mutex<HashMap<IdempotencyKey, Arc<Mutex<()>>>>,
}

struct Row {
    lock: Arc<Mutex<()>>,
    energy: AtomicI64,
}

#[derive(Default)]
struct EventTable {
    by_key: HashMap<IdempotencyKey, ConsumptionEvent>,
    by_account: HashMap<AccountId, Vec<IdempotencyKey>>,
}

impl EventTable {
    fn insert(&mut self, event: ConsumptionEvent) {
        self.by_account
            .entry(event.account_id)
            .or_default()
            .push(event.idempotency_key.clone());
        self.by_key.insert(event.idempotency_key.clone(), event);
    }
}

impl InMemoryLedgerStore {
    /// Creates a new, empty store whose lock waits never time out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds every row-lock and key-lock wait.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

async fn acquire<T>(
    lock_timeout: Option<Duration>,
    wait: impl Future<Output = T>,
    what: impl FnOnce() -> String,
) -> Result<T, StoreError> {
    match lock_timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| StoreError::LockTimeout(what())),
        None => Ok(wait.await),
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn UnitOfWork + 'a>, StoreError> {
        Ok(Box::new(InMemoryUnitOfWork {
            tables: Arc::clone(&self.inner),
            lock_timeout: self.lock_timeout,
            rows: HashMap::new(),
            key_locks: Vec::new(),
            staged_events: Vec::new(),
        }))
    }

    async fn create_account(&self, id: AccountId, energy: Energy) -> Result<Account, StoreError> {
        let mut accounts = self.inner.accounts.write().await;
        if accounts.contains_key(&id) {
            return Err(StoreError::DuplicateKey(format!("account {}", id)));
        }
        accounts.insert(
            id,
            Arc::new(Row {
                lock: Arc::new(Mutex::new(())),
                energy: AtomicI64::new(energy.value()),
            }),
        );
        Ok(Account::new(id, energy))
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let accounts = self.inner.accounts.read().await;
        Ok(accounts
            .get(&id)
            .map(|row| Account::new(id, Energy(row.energy.load(Ordering::SeqCst)))))
    }

    async fn consumptions(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<ConsumptionEvent>, StoreError> {
        let events = self.inner.events.read().await;
        Ok(events
            .by_account
            .get(&account_id)
            .into_iter()
            .flatten()
            .filter_map(|key| events.by_key.get(key).cloned())
            .collect())
    }

    async fn consumption_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ConsumptionEvent>, StoreError> {
        let events = self.inner.events.read().await;
        Ok(events.by_key.get(key).cloned())
    }
}

/// A unit of work's claim on an idempotency key, granted or still waiting.
///
/// Dropping the last claim on a key removes its lock from the table.
struct KeyLock {
    tables: Arc<Tables>,
    key: IdempotencyKey,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLock {
    fn checkout(tables: &Arc<Tables>, key: &IdempotencyKey) -> Self {
        let mut key_locks = tables
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(key_locks.entry(key.clone()).or_default());
        Self {
            tables: Arc::clone(tables),
            key: key.clone(),
            lock,
            guard: None,
        }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut key_locks = self
            .tables
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Clones are only made under the table lock: two references means
        // the table entry and this claim, so nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            key_locks.remove(&self.key);
        }
    }
}

struct LockedRow {
    row: Arc<Row>,
    staged: Energy,
    _guard: OwnedMutexGuard<()>,
}

/// A unit of work against [`InMemoryLedgerStore`].
///
/// Writes are staged locally and published in one step by `commit`.
pub struct InMemoryUnitOfWork {
    tables: Arc<Tables>,
    lock_timeout: Option<Duration>,
    rows: HashMap<AccountId, LockedRow>,
    key_locks: Vec<KeyLock>,
    staged_events: Vec<ConsumptionEvent>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        if let Some(locked) = self.rows.get(&id) {
            return Ok(Some(Account::new(id, locked.staged)));
        }

        let row = match self.tables.accounts.read().await.get(&id) {
            Some(row) => Arc::clone(row),
            None => return Ok(None),
        };

        let guard = acquire(self.lock_timeout, Arc::clone(&row.lock).lock_owned(), || {
            format!("account {}", id)
        })
        .await?;

        // Read only after the lock is granted so the previous holder's commit is visible.
        let energy = Energy(row.energy.load(Ordering::SeqCst));
        self.rows.insert(
            id,
            LockedRow {
                row,
                staged: energy,
                _guard: guard,
            },
        );
        Ok(Some(Account::new(id, energy)))
    }

    async fn insert_consumption(
        &mut self,
        new: NewConsumption,
    ) -> Result<ConsumptionEvent, StoreError> {
        if !self.tables.accounts.read().await.contains_key(&new.account_id) {
            return Err(StoreError::Backend(format!(
                "foreign key violation: account {} does not exist",
                new.account_id
            )));
        }

        let key = new.idempotency_key.clone();
        if self.staged_events.iter().any(|e| e.idempotency_key == key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }

        let mut key_lock = KeyLock::checkout(&self.tables, &key);
        let guard = acquire(
            self.lock_timeout,
            Arc::clone(&key_lock.lock).lock_owned(),
            || format!("idempotency key {}", key),
        )
        .await?;
        key_lock.guard = Some(guard);

        if self.tables.events.read().await.by_key.contains_key(&key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }

        let event = ConsumptionEvent::record(new);
        self.key_locks.push(key_lock);
        self.staged_events.push(event.clone());
        Ok(event)
    }

    async fn debit(&mut self, id: AccountId, amount: Amount) -> Result<Option<Energy>, StoreError> {
        let locked = self.rows.get_mut(&id).ok_or(StoreError::NotLocked(id))?;
        let remaining = locked.staged.checked_debit(amount);
        if let Some(energy) = remaining {
            locked.staged = energy;
        }
        Ok(remaining)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut events = this.tables.events.write().await;
        for event in this.staged_events {
            events.insert(event);
        }
        for locked in this.rows.values() {
            locked.row.energy.store(locked.staged.value(), Ordering::SeqCst);
        }
        drop(events);
        // Row and key locks drop here, after the writes are published.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
