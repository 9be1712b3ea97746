use crate::domain::account::{AccountId, Amount, Energy};
use miette::Diagnostic;
use thiserror::Error;

/// Failures raised by a storage adapter.
///
/// `DuplicateKey` is the uniqueness-constraint signal and must stay
/// distinguishable from every other write failure.
#[derive(Error, Diagnostic, Debug)]
pub enum StoreError {
    #[error("Unique constraint violated for key: {0}")]
    #[diagnostic(code(store::duplicate_key))]
    DuplicateKey(String),
    #[error("Timed out waiting for a lock on {0}")]
    #[diagnostic(code(store::lock_timeout))]
    LockTimeout(String),
    #[error("Account {0} is not locked by this unit of work")]
    #[diagnostic(code(store::not_locked))]
    NotLocked(AccountId),
    #[error("Corrupted record: {0}")]
    #[diagnostic(code(store::corrupted))]
    Corrupted(String),
    #[error("Storage backend error: {0}")]
    #[diagnostic(code(store::backend))]
    Backend(String),
}

impl StoreError {
    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout(_) | StoreError::Backend(_))
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum LedgerError {
    #[error("Account {0} not found")]
    #[diagnostic(code(ledger::account_not_found))]
    AccountNotFound(AccountId),
    #[error("Account {account_id}: requested {requested}, available {available}")]
    #[diagnostic(
        code(ledger::insufficient_energy),
        help("retry with a smaller amount or after the account is topped up")
    )]
    InsufficientEnergy {
        account_id: AccountId,
        requested: Amount,
        available: Energy,
    },
    #[error("Idempotency replay detected for key: {idempotency_key}")]
    #[diagnostic(code(ledger::idempotency_replay))]
    IdempotencyReplay { idempotency_key: String },
    #[error("Amount must be a positive integer, got {0}")]
    #[diagnostic(code(ledger::invalid_amount))]
    InvalidAmount(i64),
    #[error("Balance must not be negative, got {0}")]
    #[diagnostic(code(ledger::invalid_balance))]
    InvalidBalance(i64),
    #[error("Invalid idempotency key: {0}")]
    #[diagnostic(code(ledger::invalid_idempotency_key))]
    InvalidIdempotencyKey(String),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
