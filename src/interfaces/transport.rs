//! Protocol-neutral request adapter.
//!
//! Validates raw consume requests before they reach the ledger and maps
//! ledger outcomes to HTTP-equivalent statuses with JSON bodies. A concrete
//! transport (HTTP handler, CLI, queue consumer) only has to deserialize a
//! [`ConsumeRequest`] and write out the returned [`Response`].

use crate::application::ledger::EnergyLedger;
use crate::domain::account::{AccountId, Amount};
use crate::domain::consumption::IdempotencyKey;
use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

pub const MISSING_FIELDS: &str = "account_id, amount, and idempotency_key are required.";
pub const NOT_INTEGERS: &str = "account_id and amount must be integers.";
pub const NOT_POSITIVE: &str = "amount must be a positive integer.";
pub const ACCOUNT_NOT_FOUND: &str = "Account not found.";
pub const ALREADY_PROCESSED: &str = "Request already processed.";
pub const INTERNAL_ERROR: &str = "Internal error.";

/// A request field as it arrives on the wire: a number, a string, or
/// something else entirely.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Field {
    Integer(i64),
    Text(String),
    Other(Value),
}

impl Field {
    fn is_blank(&self) -> bool {
        match self {
            Field::Text(text) => text.trim().is_empty(),
            Field::Other(Value::Null) => true,
            _ => false,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            Field::Integer(value) => Some(*value),
            Field::Text(text) => text.trim().parse().ok(),
            Field::Other(_) => None,
        }
    }

    /// The field as the caller sent it, for echoing back in reports.
    pub fn as_text(&self) -> String {
        match self {
            Field::Integer(value) => value.to_string(),
            Field::Text(text) => text.clone(),
            Field::Other(value) => value.to_string(),
        }
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Integer(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Text(value.to_string())
    }
}

/// An unvalidated consume request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConsumeRequest {
    #[serde(default)]
    pub account_id: Option<Field>,
    #[serde(default)]
    pub amount: Option<Field>,
    #[serde(default)]
    pub idempotency_key: Option<Field>,
}

/// A request that passed validation and may be handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeCommand {
    pub account_id: AccountId,
    pub amount: Amount,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    UnprocessableEntity,
    InternalServerError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::UnprocessableEntity => 422,
            Status::InternalServerError => 500,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub body: Value,
}

impl Response {
    fn error(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn message(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "message": message.into() }),
        }
    }
}

impl ConsumeRequest {
    /// Checks presence, integer shape and positivity of the fields.
    ///
    /// The error is the 400 response to return to the caller.
    pub fn validate(&self) -> Result<ConsumeCommand, Response> {
        let (Some(account_id), Some(amount), Some(key)) =
            (&self.account_id, &self.amount, &self.idempotency_key)
        else {
            return Err(Response::error(Status::BadRequest, MISSING_FIELDS));
        };
        if account_id.is_blank() || amount.is_blank() || key.is_blank() {
            return Err(Response::error(Status::BadRequest, MISSING_FIELDS));
        }

        let (Some(account_id), Some(amount)) = (account_id.as_integer(), amount.as_integer())
        else {
            return Err(Response::error(Status::BadRequest, NOT_INTEGERS));
        };

        let amount =
            Amount::new(amount).map_err(|_| Response::error(Status::BadRequest, NOT_POSITIVE))?;
        let idempotency_key = IdempotencyKey::new(key.as_text())
            .map_err(|e| Response::error(Status::BadRequest, e.to_string()))?;

        Ok(ConsumeCommand {
            account_id: AccountId(account_id),
            amount,
            idempotency_key,
        })
    }
}

/// Validates `request`, runs it through the ledger and maps the outcome.
pub async fn handle(ledger: &EnergyLedger, request: &ConsumeRequest) -> Response {
    let command = match request.validate() {
        Ok(command) => command,
        Err(response) => return response,
    };

    let outcome = ledger
        .consume(command.account_id, command.amount, command.idempotency_key)
        .await;

    match outcome {
        Ok(receipt) => Response {
            status: Status::Ok,
            body: json!(receipt),
        },
        Err(err) => error_response(err),
    }
}

/// Maps a ledger error to the response a caller should see.
pub fn error_response(err: LedgerError) -> Response {
    match err {
        LedgerError::AccountNotFound(_) => Response::error(Status::NotFound, ACCOUNT_NOT_FOUND),
        LedgerError::InsufficientEnergy { .. } => {
            Response::error(Status::UnprocessableEntity, err.to_string())
        }
        LedgerError::IdempotencyReplay { .. } => Response::message(Status::Ok, ALREADY_PROCESSED),
        LedgerError::InvalidAmount(_) => Response::error(Status::BadRequest, NOT_POSITIVE),
        LedgerError::InvalidBalance(_) | LedgerError::InvalidIdempotencyKey(_) => {
            Response::error(Status::BadRequest, err.to_string())
        }
        LedgerError::Store(store_err) => {
            error!(error = %store_err, retryable = store_err.is_retryable(), "store failure");
            Response::error(Status::InternalServerError, INTERNAL_ERROR)
        }
    }
}
