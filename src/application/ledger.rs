use crate::domain::account::{Account, AccountId, Amount, Energy};
use crate::domain::consumption::{ConsumptionEvent, IdempotencyKey, NewConsumption};
use crate::domain::ports::{LedgerStoreBox, UnitOfWork};
use crate::error::{LedgerError, Result, StoreError};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

/// The outcome of a successful consumption.
#[derive(Debug, Serialize, PartialEq, Eq, Clone)]
pub struct ConsumeReceipt {
    pub account_id: AccountId,
    pub remaining_energy: Energy,
    pub amount_consumed: Amount,
}

/// The balance-deduction service.
///
/// `EnergyLedger` owns the store handle it is given and is `Send + Sync`, so a
/// single instance can be shared behind an `Arc` by any number of callers.
/// Calls against the same account are serialized by the store's row lock;
/// calls against different accounts run in parallel.
pub struct EnergyLedger {
    store: LedgerStoreBox,
}

impl EnergyLedger {
    /// Creates a new `EnergyLedger` backed by `store`.
    pub fn new(store: LedgerStoreBox) -> Self {
        Self { store }
    }

    /// Deducts `amount` from an account exactly once per idempotency key.
    ///
    /// Runs as a single unit of work:
    ///
    /// 1. lock the account row (`AccountNotFound` if it does not exist),
    /// 2. check the locked balance covers `amount` (`InsufficientEnergy`),
    /// 3. insert the consumption event (`IdempotencyReplay` on a duplicate key),
    /// 4. debit the stored balance,
    /// 5. commit.
    ///
    /// Every error path aborts the unit of work, so either the event and the
    /// debit are both persisted or neither is. If the returned future is
    /// dropped before it completes, the store rolls the unit back.
    #[instrument(
        skip_all,
        fields(account_id = %account_id, amount = %amount, idempotency_key = %idempotency_key)
    )]
    pub async fn consume(
        &self,
        account_id: AccountId,
        amount: Amount,
        idempotency_key: IdempotencyKey,
    ) -> Result<ConsumeReceipt> {
        let mut uow = self.store.begin().await?;

        let account = match uow.lock_account(account_id).await? {
            Some(account) => account,
            None => return abort(uow, LedgerError::AccountNotFound(account_id)).await,
        };

        if !account.energy.covers(amount) {
            warn!(
                requested = amount.value(),
                available = account.energy.value(),
                "insufficient energy"
            );
            return abort(uow, insufficient(account_id, amount, account.energy)).await;
        }

        let new = NewConsumption {
            account_id,
            amount,
            idempotency_key: idempotency_key.clone(),
        };
        match uow.insert_consumption(new).await {
            Ok(_) => {}
            Err(StoreError::DuplicateKey(_)) => {
                info!("idempotency replay");
                let replay = LedgerError::IdempotencyReplay {
                    idempotency_key: idempotency_key.to_string(),
                };
                return abort(uow, replay).await;
            }
            Err(e) => return abort(uow, e.into()).await,
        }

        let remaining_energy = match uow.debit(account_id, amount).await {
            Ok(Some(remaining)) => remaining,
            Ok(None) => {
                return abort(uow, insufficient(account_id, amount, account.energy)).await;
            }
            Err(e) => return abort(uow, e.into()).await,
        };

        uow.commit().await?;
        debug!(remaining = remaining_energy.value(), "consumption committed");

        Ok(ConsumeReceipt {
            account_id,
            remaining_energy,
            amount_consumed: amount,
        })
    }

    /// Creates an account with an opening balance.
    pub async fn open_account(&self, id: AccountId, energy: i64) -> Result<Account> {
        if energy < 0 {
            return Err(LedgerError::InvalidBalance(energy));
        }
        Ok(self.store.create_account(id, Energy(energy)).await?)
    }

    /// Returns the committed balance of an account.
    pub async fn balance(&self, id: AccountId) -> Result<Energy> {
        self.store
            .account(id)
            .await?
            .map(|account| account.energy)
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// Returns every consumption recorded against an account, oldest first.
    pub async fn history(&self, id: AccountId) -> Result<Vec<ConsumptionEvent>> {
        Ok(self.store.consumptions(id).await?)
    }

    /// Looks up the event an idempotency key produced, if any.
    pub async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<ConsumptionEvent>> {
        Ok(self.store.consumption_by_key(key).await?)
    }
}

fn insufficient(account_id: AccountId, amount: Amount, available: Energy) -> LedgerError {
    LedgerError::InsufficientEnergy {
        account_id,
        requested: amount,
        available,
    }
}

/// Rolls the unit of work back and returns `err`.
///
/// A failed rollback is only logged: the store discards uncommitted work on
/// drop anyway, and the caller needs the original error.
async fn abort<T>(uow: Box<dyn UnitOfWork + '_>, err: LedgerError) -> Result<T> {
    if let Err(rollback_err) = uow.rollback().await {
        error!(error = %rollback_err, "rollback failed");
    }
    Err(err)
}
