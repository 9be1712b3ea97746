use super::account::{Account, AccountId, Amount, Energy};
use super::consumption::{ConsumptionEvent, IdempotencyKey, NewConsumption};
use crate::error::StoreError;
use async_trait::async_trait;

/// A durable store able to run ledger units of work.
///
/// Implementations must provide three primitives inside one all-or-nothing
/// unit: an exclusive row lock on an account, a uniqueness constraint on
/// idempotency keys, and a debit evaluated against the stored value.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens a new unit of work. Nothing it does is visible until `commit`.
    async fn begin<'a>(&'a self) -> Result<Box<dyn UnitOfWork + 'a>, StoreError>;

    /// Inserts a new account. Fails with `DuplicateKey` if the id exists.
    async fn create_account(&self, id: AccountId, energy: Energy) -> Result<Account, StoreError>;

    /// Reads the last committed state of an account.
    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// All events recorded against an account, oldest first.
    async fn consumptions(&self, account_id: AccountId)
    -> Result<Vec<ConsumptionEvent>, StoreError>;

    async fn consumption_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ConsumptionEvent>, StoreError>;
}

/// One in-flight unit of work.
///
/// Dropping a unit without calling `commit` must discard its effects and
/// release every lock it holds.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Locks the account row exclusively, blocking until granted.
    ///
    /// Returns `None` if the account does not exist.
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Records a consumption event.
    ///
    /// Fails with `StoreError::DuplicateKey` if any unit of work has already
    /// committed an event with the same idempotency key.
    async fn insert_consumption(
        &mut self,
        new: NewConsumption,
    ) -> Result<ConsumptionEvent, StoreError>;

    /// Subtracts `amount` from the stored balance of a locked account.
    ///
    /// Returns the new balance, or `None` when the stored balance is lower
    /// than `amount` (nothing is changed in that case).
    async fn debit(&mut self, id: AccountId, amount: Amount) -> Result<Option<Energy>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub type LedgerStoreBox = Box<dyn LedgerStore>;
