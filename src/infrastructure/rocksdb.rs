use crate::domain::account::{Account, AccountId, Amount, Energy};
use crate::domain::consumption::{ConsumptionEvent, IdempotencyKey, NewConsumption};
use crate::domain::ports::{LedgerStore, UnitOfWork};
use crate::error::StoreError;
use async_trait::async_trait;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, Options,
    Transaction, TransactionDB, TransactionDBOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Column Family for account rows, keyed by big-endian account id.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family for consumption events, keyed by account id then event id.
pub const CF_CONSUMPTIONS: &str = "consumptions";
/// Column Family acting as the unique index on idempotency keys.
pub const CF_CONSUMPTION_KEYS: &str = "consumption_keys";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// A persistent store implementation using a RocksDB `TransactionDB`.
///
/// Pessimistic transactions supply the three primitives the ledger needs:
/// `get_for_update` on an account key is the row lock, `get_for_update` on
/// the idempotency key followed by a put is the unique insert, and the debit
/// re-reads the locked row inside the transaction before writing it back.
/// Lock waits are bounded by the `TransactionDB` lock timeout.
///
/// Lock waits block the calling thread. On a multi-threaded runtime they run
/// under `block_in_place`, so other tasks (including the lock holder) keep
/// making progress. On a current-thread runtime a unit of work must not hold
/// a lock across an `.await` that another unit is waiting behind.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<TransactionDB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<TransactionDB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path with the
    /// default lock timeout.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    /// * `lock_timeout` - How long a transaction waits for a key lock.
    pub fn open_with_lock_timeout<P: AsRef<Path>>(
        path: P,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_db_opts = TransactionDBOptions::default();
        let lock_timeout_ms = i64::try_from(lock_timeout.as_millis()).map_err(|_| {
            StoreError::Backend(format!("lock timeout {:?} is out of range", lock_timeout))
        })?;
        txn_db_opts.set_txn_lock_timeout(lock_timeout_ms);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CONSUMPTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CONSUMPTION_KEYS, Options::default()),
        ];

        let db = TransactionDB::open_cf_descriptors(&opts, &txn_db_opts, path, cfs)
            .map_err(|e| map_rocksdb_error("open", e))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("{} column family not found", name)))
    }

    fn event_by_storage_key(
        &self,
        storage_key: &[u8],
    ) -> Result<Option<ConsumptionEvent>, StoreError> {
        let cf = self.cf(CF_CONSUMPTIONS)?;
        self.db
            .get_cf(cf, storage_key)
            .map_err(|e| map_rocksdb_error("get consumption", e))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

/// Runs a call that may wait on a transaction lock.
fn blocking<T>(call: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}

fn account_key(id: AccountId) -> [u8; 8] {
    id.0.to_be_bytes()
}

fn event_key(event: &ConsumptionEvent) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&account_key(event.account_id));
    key.extend_from_slice(event.id.0.as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupted(format!("Serialization error: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Corrupted(format!("Deserialization error: {}", e)))
}

fn map_rocksdb_error(operation: &str, err: rocksdb::Error) -> StoreError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::Busy => {
            StoreError::LockTimeout(format!("{}: {}", operation, err))
        }
        _ => StoreError::Backend(format!("rocksdb error in {}: {}", operation, err)),
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn UnitOfWork + 'a>, StoreError> {
        Ok(Box::new(RocksDBUnitOfWork {
            store: self,
            txn: self.db.transaction(),
            locked: HashSet::new(),
        }))
    }

    async fn create_account(&self, id: AccountId, energy: Energy) -> Result<Account, StoreError> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let account = Account::new(id, energy);

        let txn = self.db.transaction();
        let existing = blocking(|| txn.get_for_update_cf(cf, account_key(id), true))
            .map_err(|e| map_rocksdb_error("lock account", e))?;
        if existing.is_some() {
            return Err(StoreError::DuplicateKey(format!("account {}", id)));
        }
        txn.put_cf(cf, account_key(id), encode(&account)?)
            .map_err(|e| map_rocksdb_error("put account", e))?;
        txn.commit()
            .map_err(|e| map_rocksdb_error("commit", e))?;

        Ok(account)
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let cf = self.cf(CF_ACCOUNTS)?;
        self.db
            .get_cf(cf, account_key(id))
            .map_err(|e| map_rocksdb_error("get account", e))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn consumptions(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<ConsumptionEvent>, StoreError> {
        let cf = self.cf(CF_CONSUMPTIONS)?;
        let prefix = account_key(account_id);

        let mut events = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix[..], Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| map_rocksdb_error("iterate consumptions", e))?;
            if !key.starts_with(&prefix[..]) {
                break;
            }
            events.push(decode::<ConsumptionEvent>(&value)?);
        }
        events.sort_by_key(|event| event.created_at);

        Ok(events)
    }

    async fn consumption_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ConsumptionEvent>, StoreError> {
        let cf = self.cf(CF_CONSUMPTION_KEYS)?;
        match self
            .db
            .get_cf(cf, key.as_str().as_bytes())
            .map_err(|e| map_rocksdb_error("get consumption key", e))?
        {
            Some(storage_key) => self.event_by_storage_key(&storage_key),
            None => Ok(None),
        }
    }
}

/// A unit of work backed by one pessimistic RocksDB transaction.
///
/// Dropping the transaction without committing rolls it back and releases
/// its key locks.
pub struct RocksDBUnitOfWork<'a> {
    store: &'a RocksDBStore,
    txn: Transaction<'a, TransactionDB>,
    locked: HashSet<AccountId>,
}

impl RocksDBUnitOfWork<'_> {
    fn read_locked(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let cf = self.store.cf(CF_ACCOUNTS)?;
        blocking(|| self.txn.get_for_update_cf(cf, account_key(id), true))
            .map_err(|e| map_rocksdb_error("lock account", e))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

#[async_trait]
impl UnitOfWork for RocksDBUnitOfWork<'_> {
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let account = self.read_locked(id)?;
        if account.is_some() {
            self.locked.insert(id);
        }
        Ok(account)
    }

    async fn insert_consumption(
        &mut self,
        new: NewConsumption,
    ) -> Result<ConsumptionEvent, StoreError> {
        let accounts = self.store.cf(CF_ACCOUNTS)?;
        let keys = self.store.cf(CF_CONSUMPTION_KEYS)?;
        let consumptions = self.store.cf(CF_CONSUMPTIONS)?;

        let exists = self
            .txn
            .get_cf(accounts, account_key(new.account_id))
            .map_err(|e| map_rocksdb_error("get account", e))?;
        if exists.is_none() {
            return Err(StoreError::Backend(format!(
                "foreign key violation: account {} does not exist",
                new.account_id
            )));
        }

        // Locking the key entry makes a concurrent insert of the same key wait
        // for this transaction, then observe whatever it committed.
        let key_bytes = new.idempotency_key.as_str().as_bytes().to_vec();
        let taken = blocking(|| self.txn.get_for_update_cf(keys, &key_bytes, true))
            .map_err(|e| map_rocksdb_error("lock idempotency key", e))?;
        if taken.is_some() {
            return Err(StoreError::DuplicateKey(new.idempotency_key.to_string()));
        }

        let event = ConsumptionEvent::record(new);
        let storage_key = event_key(&event);
        self.txn
            .put_cf(consumptions, &storage_key, encode(&event)?)
            .map_err(|e| map_rocksdb_error("put consumption", e))?;
        self.txn
            .put_cf(keys, &key_bytes, &storage_key)
            .map_err(|e| map_rocksdb_error("put consumption key", e))?;

        Ok(event)
    }

    async fn debit(&mut self, id: AccountId, amount: Amount) -> Result<Option<Energy>, StoreError> {
        if !self.locked.contains(&id) {
            return Err(StoreError::NotLocked(id));
        }

        let mut account = self
            .read_locked(id)?
            .ok_or_else(|| StoreError::Corrupted(format!("locked account {} vanished", id)))?;
        let Some(remaining) = account.energy.checked_debit(amount) else {
            return Ok(None);
        };

        account.energy = remaining;
        let cf = self.store.cf(CF_ACCOUNTS)?;
        self.txn
            .put_cf(cf, account_key(id), encode(&account)?)
            .map_err(|e| map_rocksdb_error("put account", e))?;

        Ok(Some(remaining))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.txn
            .commit()
            .map_err(|e| map_rocksdb_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.txn
            .rollback()
            .map_err(|e| map_rocksdb_error("rollback", e))
    }
}
