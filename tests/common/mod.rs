#![allow(dead_code)]

pub mod ledger_checks;

use rand::Rng;
use std::fs::File;
use std::io::Error;
use std::path::Path;

pub fn generate_accounts_csv(path: &Path, accounts: &[(i64, i64)]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["id", "energy"])?;
    for (id, energy) in accounts {
        wtr.write_record([id.to_string(), energy.to_string()])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Writes `rows` requests of `amount` against one account, each with its own key.
pub fn generate_requests_csv(
    path: &Path,
    account_id: i64,
    amount: i64,
    rows: usize,
) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["account_id", "amount", "idempotency_key"])?;
    for i in 1..=rows {
        wtr.write_record([
            account_id.to_string(),
            amount.to_string(),
            format!("req-{}", i),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Splits `total` into `parts` positive amounts that sum to `total`.
pub fn random_split(total: i64, parts: usize) -> Vec<i64> {
    assert!(parts > 0 && total >= parts as i64);
    let mut rng = rand::thread_rng();

    // Pick `parts - 1` distinct cut points in 1..total.
    let mut cuts = std::collections::BTreeSet::new();
    while cuts.len() < parts - 1 {
        cuts.insert(rng.gen_range(1..total));
    }

    let mut amounts = Vec::with_capacity(parts);
    let mut previous = 0;
    for cut in cuts.into_iter().chain(std::iter::once(total)) {
        amounts.push(cut - previous);
        previous = cut;
    }
    amounts
}

/// A random account id, so runs against a shared database do not collide.
pub fn random_account_id() -> i64 {
    rand::thread_rng().gen_range(1_000_000..i64::MAX / 2)
}

/// A random idempotency key prefix.
pub fn random_prefix() -> String {
    format!("run-{}", rand::thread_rng().r#gen::<u64>())
}
