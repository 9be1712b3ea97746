use super::account::{AccountId, Amount};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a consumption event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumptionId(pub Uuid);

impl ConsumptionId {
    /// UUID v7, so ids roughly follow creation time.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ConsumptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token identifying one logical consume request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Longest key the stores accept.
    pub const MAX_LEN: usize = 100;

    pub fn new(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        if value.is_empty() {
            return Err(LedgerError::InvalidIdempotencyKey(
                "idempotency_key must not be empty".to_string(),
            ));
        }
        if value.chars().count() > Self::MAX_LEN {
            return Err(LedgerError::InvalidIdempotencyKey(format!(
                "idempotency_key must be at most {} characters",
                Self::MAX_LEN
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fields a caller supplies when recording a consumption.
///
/// The store assigns `id` and `created_at` on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConsumption {
    pub account_id: AccountId,
    pub amount: Amount,
    pub idempotency_key: IdempotencyKey,
}

/// An append-only record of one applied deduction.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct ConsumptionEvent {
    pub id: ConsumptionId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>,
}

impl ConsumptionEvent {
    /// Stamps a new event with a fresh id and the current time.
    pub fn record(new: NewConsumption) -> Self {
        Self {
            id: ConsumptionId::generate(),
            account_id: new.account_id,
            amount: new.amount,
            idempotency_key: new.idempotency_key,
            created_at: Utc::now(),
        }
    }
}
