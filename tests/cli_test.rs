use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("energy-ledger"));
    cmd.env_remove("DATABASE_URL")
        .arg("tests/fixtures/requests.csv")
        .arg("--accounts")
        .arg("tests/fixtures/accounts.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "idempotency_key,status,remaining_energy,message",
        ))
        .stdout(predicate::str::contains("req-1,200,70,\n"))
        .stdout(predicate::str::contains(
            "req-1,200,,Request already processed.",
        ))
        .stdout(predicate::str::contains(
            "req-2,422,,\"Account 1: requested 200, available 70\"",
        ))
        .stdout(predicate::str::contains("req-3,200,0,\n"))
        .stdout(predicate::str::contains(
            "req-4,422,,\"Account 3: requested 1, available 0\"",
        ))
        .stdout(predicate::str::contains("req-5,404,,Account not found."))
        .stdout(predicate::str::contains(
            "req-6,400,,amount must be a positive integer.",
        ));

    Ok(())
}

#[test]
fn test_cli_without_accounts_reports_not_found() {
    let mut cmd = Command::new(cargo_bin!("energy-ledger"));
    cmd.env_remove("DATABASE_URL")
        .arg("tests/fixtures/requests.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("req-1,404,,Account not found."))
        .stdout(predicate::str::contains(",200,").not());
}

#[test]
fn test_cli_missing_input_fails() {
    let mut cmd = Command::new(cargo_bin!("energy-ledger"));
    cmd.env_remove("DATABASE_URL")
        .arg("tests/fixtures/does_not_exist.csv");

    cmd.assert().failure();
}

#[test]
fn test_cli_rejects_out_of_range_lock_timeout() {
    for value in ["0", "2147483648", "18446744073709551615"] {
        let mut cmd = Command::new(cargo_bin!("energy-ledger"));
        cmd.env_remove("DATABASE_URL")
            .arg("tests/fixtures/requests.csv")
            .arg("--lock-timeout-ms")
            .arg(value);

        cmd.assert()
            .failure()
            .stderr(predicate::str::contains("--lock-timeout-ms"));
    }
}

#[test]
fn test_cli_accepts_largest_lock_timeout() {
    let mut cmd = Command::new(cargo_bin!("energy-ledger"));
    cmd.env_remove("DATABASE_URL")
        .arg("tests/fixtures/requests.csv")
        .arg("--lock-timeout-ms")
        .arg("2147483647");

    cmd.assert().success();
}
