//! Behavioral checks every storage adapter must pass.
//!
//! Each check opens its own accounts from the ids it is given, so callers
//! sharing one database pass fresh ids per check.

use super::random_split;
use energy_ledger::application::ledger::EnergyLedger;
use energy_ledger::domain::account::{AccountId, Amount, Energy};
use energy_ledger::domain::consumption::{IdempotencyKey, NewConsumption};
use energy_ledger::domain::ports::LedgerStore;
use energy_ledger::error::LedgerError;
use std::sync::Arc;

fn amount(value: i64) -> Amount {
    Amount::new(value).unwrap()
}

fn key(prefix: &str, suffix: &str) -> IdempotencyKey {
    IdempotencyKey::new(format!("{}-{}", prefix, suffix)).unwrap()
}

/// 100 -> consume 30 -> replay -> overdraw.
pub async fn consume_replay_and_overdraw(ledger: &EnergyLedger, id: i64, prefix: &str) {
    let id = AccountId(id);
    ledger.open_account(id, 100).await.unwrap();

    let receipt = ledger.consume(id, amount(30), key(prefix, "a")).await.unwrap();
    assert_eq!(receipt.remaining_energy, Energy(70));

    let replay = ledger.consume(id, amount(30), key(prefix, "a")).await;
    assert!(matches!(replay, Err(LedgerError::IdempotencyReplay { .. })));
    assert_eq!(ledger.balance(id).await.unwrap(), Energy(70));

    let overdraw = ledger.consume(id, amount(200), key(prefix, "b")).await;
    match overdraw {
        Err(LedgerError::InsufficientEnergy {
            requested,
            available,
            ..
        }) => {
            assert_eq!(requested, amount(200));
            assert_eq!(available, Energy(70));
        }
        other => panic!("expected InsufficientEnergy, got {:?}", other),
    }

    let history = ledger.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].idempotency_key, key(prefix, "a"));
    assert!(ledger.find_by_key(&key(prefix, "b")).await.unwrap().is_none());
}

/// Concurrent requests that sum exactly to the balance all succeed and drain it.
pub async fn concurrent_split_drains_account(
    ledger: Arc<EnergyLedger>,
    id: i64,
    prefix: &str,
    parts: usize,
) {
    let id = AccountId(id);
    let total = 1_000;
    ledger.open_account(id, total).await.unwrap();

    let handles: Vec<_> = random_split(total, parts)
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let ledger = Arc::clone(&ledger);
            let key = key(prefix, &i.to_string());
            tokio::spawn(async move { ledger.consume(id, amount(value), key).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(ledger.balance(id).await.unwrap(), Energy::ZERO);
    assert_eq!(ledger.history(id).await.unwrap().len(), parts);
}

/// Two requests of just over half the balance: exactly one wins.
pub async fn over_half_race_has_one_winner(ledger: Arc<EnergyLedger>, id: i64, prefix: &str) {
    let id = AccountId(id);
    ledger.open_account(id, 100).await.unwrap();

    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|side| {
            let ledger = Arc::clone(&ledger);
            let key = key(prefix, side);
            tokio::spawn(async move { ledger.consume(id, amount(60), key).await })
        })
        .collect();

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => {
                assert_eq!(receipt.remaining_energy, Energy(40));
                successes += 1;
            }
            Err(LedgerError::InsufficientEnergy { available, .. }) => {
                assert_eq!(available, Energy(40));
                rejections += 1;
            }
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!((successes, rejections), (1, 1));
    assert_eq!(ledger.balance(id).await.unwrap(), Energy(40));
}

/// Many concurrent copies of one request deduct once.
pub async fn same_key_race_deducts_once(ledger: Arc<EnergyLedger>, id: i64, prefix: &str) {
    let id = AccountId(id);
    ledger.open_account(id, 100).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let key = key(prefix, "shared");
            tokio::spawn(async move { ledger.consume(id, amount(10), key).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(LedgerError::IdempotencyReplay { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(ledger.balance(id).await.unwrap(), Energy(90));
    assert_eq!(ledger.history(id).await.unwrap().len(), 1);
}

/// One key used against two accounts at once is consumed by only one of them.
pub async fn same_key_across_accounts_deducts_once(
    ledger: Arc<EnergyLedger>,
    first: i64,
    second: i64,
    prefix: &str,
) {
    let (first, second) = (AccountId(first), AccountId(second));
    ledger.open_account(first, 100).await.unwrap();
    ledger.open_account(second, 100).await.unwrap();

    let handles: Vec<_> = [first, second]
        .into_iter()
        .map(|id| {
            let ledger = Arc::clone(&ledger);
            let key = key(prefix, "cross");
            tokio::spawn(async move { ledger.consume(id, amount(25), key).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|o| matches!(o, Err(LedgerError::IdempotencyReplay { .. })))
    );

    let first_balance = ledger.balance(first).await.unwrap().value();
    let second_balance = ledger.balance(second).await.unwrap().value();
    assert_eq!(first_balance + second_balance, 175);

    let event = ledger.find_by_key(&key(prefix, "cross")).await.unwrap().unwrap();
    let charged = if first_balance == 75 { first } else { second };
    assert_eq!(event.account_id, charged);
}

/// A unit of work dropped after its insert and debit, as when a consume
/// future is cancelled just before commit, leaves no trace and no locks.
///
/// `ledger` must run on the same data as `store`.
pub async fn dropped_unit_leaves_no_trace(
    store: &dyn LedgerStore,
    ledger: &EnergyLedger,
    id: i64,
    prefix: &str,
) {
    let id = AccountId(id);
    ledger.open_account(id, 100).await.unwrap();

    {
        let mut uow = store.begin().await.unwrap();
        uow.lock_account(id).await.unwrap().unwrap();
        uow.insert_consumption(NewConsumption {
            account_id: id,
            amount: amount(10),
            idempotency_key: key(prefix, "dropped"),
        })
        .await
        .unwrap();
        let staged = uow.debit(id, amount(10)).await.unwrap();
        assert_eq!(staged, Some(Energy(90)));
    }

    assert_eq!(ledger.balance(id).await.unwrap(), Energy(100));
    assert!(
        ledger
            .find_by_key(&key(prefix, "dropped"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(ledger.history(id).await.unwrap().is_empty());

    // Neither the row nor the key stayed locked.
    let receipt = ledger
        .consume(id, amount(10), key(prefix, "dropped"))
        .await
        .unwrap();
    assert_eq!(receipt.remaining_energy, Energy(90));
}
