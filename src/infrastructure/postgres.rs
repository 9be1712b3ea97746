//! PostgreSQL-backed ledger store.
//!
//! Each unit of work is one database transaction:
//!
//! - the row lock is `SELECT ... FOR UPDATE` on `accounts`,
//! - the idempotency guarantee is the `UNIQUE` constraint on
//!   `energy_consumptions.idempotency_key`,
//! - the debit is `UPDATE ... SET energy = energy - $2 WHERE energy >= $2`,
//!   evaluated by the database against the row it holds.
//!
//! Lock waits are bounded per transaction with `SET LOCAL lock_timeout`.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | StoreError | Scenario |
//! |-----------------------|------------|----------|
//! | `23505` | `DuplicateKey` | Idempotency key or account id already exists |
//! | `55P03` | `LockTimeout` | Row lock not granted within `lock_timeout` |
//! | `40P01` | `LockTimeout` | Deadlock detected, transaction chosen as victim |
//! | Any other | `Backend` | Connectivity, constraint or engine failure |

use crate::domain::account::{Account, AccountId, Amount, Energy};
use crate::domain::consumption::{ConsumptionEvent, ConsumptionId, IdempotencyKey, NewConsumption};
use crate::domain::ports::{LedgerStore, UnitOfWork};
use crate::error::StoreError;
use crate::infrastructure::MAX_LOCK_TIMEOUT_MS;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Schema applied by [`PostgresLedgerStore::migrate`]. Safe to run repeatedly.
pub const SCHEMA: &str = include_str!("../../migrations/0001_energy_ledger.sql");

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

const MIGRATION_LOCK_ID: i64 = 0x656e_6572_6779;

/// Postgres-backed ledger store.
///
/// Uses a SQLx connection pool, so it is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Opens a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Creates the tables and indexes if they do not exist yet.
    ///
    /// Concurrent callers are serialized on an advisory lock, since
    /// `CREATE TABLE IF NOT EXISTS` is not safe to race.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        sqlx::raw_sql(SCHEMA)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("migrate", e))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn UnitOfWork + 'a>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(lock_timeout_setting(self.lock_timeout))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(Box::new(PostgresUnitOfWork {
            tx,
            locked: HashSet::new(),
        }))
    }

    async fn create_account(&self, id: AccountId, energy: Energy) -> Result<Account, StoreError> {
        sqlx::query("INSERT INTO accounts (id, energy) VALUES ($1, $2)")
            .bind(id.0)
            .bind(energy.value())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateKey(format!("account {}", id))
                } else {
                    map_sqlx_error("create_account", e)
                }
            })?;
        Ok(Account::new(id, energy))
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT id, energy FROM accounts WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("account", e))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn consumptions(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<ConsumptionEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, amount, idempotency_key, created_at
            FROM energy_consumptions
            WHERE account_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("consumptions", e))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn consumption_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ConsumptionEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, amount, idempotency_key, created_at
            FROM energy_consumptions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("consumption_by_key", e))?;

        row.as_ref().map(event_from_row).transpose()
    }
}

/// A unit of work wrapping one SQLx transaction.
///
/// Dropping it without `commit` makes SQLx roll the transaction back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    locked: HashSet<AccountId>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT id, energy FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_account", e))?;

        let account = row.as_ref().map(account_from_row).transpose()?;
        if account.is_some() {
            self.locked.insert(id);
        }
        Ok(account)
    }

    async fn insert_consumption(
        &mut self,
        new: NewConsumption,
    ) -> Result<ConsumptionEvent, StoreError> {
        let id = ConsumptionId::generate();
        let row = sqlx::query(
            r#"
            INSERT INTO energy_consumptions (id, account_id, amount, idempotency_key)
            VALUES ($1, $2, $3, $4)
            RETURNING created_at
            "#,
        )
        .bind(id.0)
        .bind(new.account_id.0)
        .bind(new.amount.value())
        .bind(new.idempotency_key.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateKey(new.idempotency_key.to_string())
            } else {
                map_sqlx_error("insert_consumption", e)
            }
        })?;

        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| StoreError::Corrupted(format!("failed to read created_at: {}", e)))?;

        Ok(ConsumptionEvent {
            id,
            account_id: new.account_id,
            amount: new.amount,
            idempotency_key: new.idempotency_key,
            created_at,
        })
    }

    async fn debit(&mut self, id: AccountId, amount: Amount) -> Result<Option<Energy>, StoreError> {
        if !self.locked.contains(&id) {
            return Err(StoreError::NotLocked(id));
        }

        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET energy = energy - $2
            WHERE id = $1 AND energy >= $2
            RETURNING energy
            "#,
        )
        .bind(id.0)
        .bind(amount.value())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("debit", e))?;

        match row {
            Some(row) => {
                let energy: i64 = row
                    .try_get("energy")
                    .map_err(|e| StoreError::Corrupted(format!("failed to read energy: {}", e)))?;
                Ok(Some(Energy(energy)))
            }
            None => Ok(None),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Renders a `lock_timeout` value PostgreSQL accepts.
///
/// `0` would disable the timeout, so the bound is at least one millisecond.
fn lock_timeout_setting(lock_timeout: Duration) -> String {
    let ms = lock_timeout
        .as_millis()
        .clamp(1, u128::from(MAX_LOCK_TIMEOUT_MS));
    format!("{}ms", ms)
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| StoreError::Corrupted(format!("failed to read account id: {}", e)))?;
    let energy: i64 = row
        .try_get("energy")
        .map_err(|e| StoreError::Corrupted(format!("failed to read energy: {}", e)))?;
    Ok(Account::new(AccountId(id), Energy(energy)))
}

fn event_from_row(row: &PgRow) -> Result<ConsumptionEvent, StoreError> {
    let corrupted = |e: sqlx::Error| StoreError::Corrupted(format!("failed to read consumption row: {}", e));

    let id: Uuid = row.try_get("id").map_err(corrupted)?;
    let account_id: i64 = row.try_get("account_id").map_err(corrupted)?;
    let amount: i64 = row.try_get("amount").map_err(corrupted)?;
    let key: String = row.try_get("idempotency_key").map_err(corrupted)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(corrupted)?;

    Ok(ConsumptionEvent {
        id: ConsumptionId(id),
        account_id: AccountId(account_id),
        amount: Amount::new(amount).map_err(|e| StoreError::Corrupted(e.to_string()))?,
        idempotency_key: IdempotencyKey::new(key)
            .map_err(|e| StoreError::Corrupted(e.to_string()))?,
        created_at,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::DuplicateKey(msg),
                Some("55P03") | Some("40P01") => StoreError::LockTimeout(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Backend(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_idempotency_constraint() {
        assert!(SCHEMA.contains("idempotency_key VARCHAR(100) NOT NULL UNIQUE"));
        assert!(SCHEMA.contains("CHECK (energy >= 0)"));
    }

    #[test]
    fn test_lock_timeout_setting_stays_bounded() {
        assert_eq!(lock_timeout_setting(Duration::from_millis(1000)), "1000ms");
        assert_eq!(lock_timeout_setting(Duration::ZERO), "1ms");
        assert_eq!(lock_timeout_setting(Duration::MAX), "2147483647ms");
    }

    #[test]
    fn test_non_database_errors_map_to_backend() {
        let err = map_sqlx_error("commit", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
