use clap::Parser;
use energy_ledger::application::ledger::EnergyLedger;
use energy_ledger::domain::ports::LedgerStoreBox;
use energy_ledger::error::{LedgerError, StoreError};
use energy_ledger::infrastructure::MAX_LOCK_TIMEOUT_MS;
use energy_ledger::infrastructure::in_memory::InMemoryLedgerStore;
#[cfg(feature = "storage-postgres")]
use energy_ledger::infrastructure::postgres::PostgresLedgerStore;
#[cfg(feature = "storage-rocksdb")]
use energy_ledger::infrastructure::rocksdb::RocksDBStore;
use energy_ledger::interfaces::csv::account_reader::AccountReader;
use energy_ledger::interfaces::csv::outcome_writer::{OutcomeRecord, OutcomeWriter};
use energy_ledger::interfaces::csv::request_reader::RequestReader;
use energy_ledger::interfaces::transport::{self, Field};
use energy_ledger::observability;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Consume requests CSV file (account_id,amount,idempotency_key)
    input: PathBuf,

    /// Accounts CSV file (id,energy) used to open accounts before processing.
    #[arg(long)]
    accounts: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// PostgreSQL connection string. Takes precedence over --db-path.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum number of pooled PostgreSQL connections.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// How long a request waits for a row or key lock before failing.
    #[arg(
        long,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..=MAX_LOCK_TIMEOUT_MS)
    )]
    lock_timeout_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    observability::init(cli.log_json);
    debug!(
        input = %cli.input.display(),
        lock_timeout_ms = cli.lock_timeout_ms,
        max_connections = cli.max_connections,
        "starting"
    );

    let ledger = EnergyLedger::new(open_store(&cli).await?);

    if let Some(accounts) = &cli.accounts {
        seed_accounts(&ledger, accounts).await?;
    }

    // Process requests, one outcome row each
    let file = File::open(&cli.input).into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = OutcomeWriter::new(stdout.lock());
    for request in RequestReader::new(file).requests() {
        match request {
            Ok(request) => {
                let response = transport::handle(&ledger, &request).await;
                let key = request
                    .idempotency_key
                    .as_ref()
                    .map(Field::as_text)
                    .unwrap_or_default();
                writer
                    .write(&OutcomeRecord::new(key, &response))
                    .into_diagnostic()?;
            }
            Err(e) => {
                eprintln!("Error reading request: {}", e);
            }
        }
    }
    writer.flush().into_diagnostic()?;

    Ok(())
}

async fn open_store(cli: &Cli) -> Result<LedgerStoreBox> {
    let lock_timeout = Duration::from_millis(cli.lock_timeout_ms);

    if let Some(database_url) = &cli.database_url {
        #[cfg(feature = "storage-postgres")]
        {
            let store = PostgresLedgerStore::connect(database_url, cli.max_connections)
                .await?
                .with_lock_timeout(lock_timeout);
            store.migrate().await?;
            info!("using PostgreSQL storage");
            return Ok(Box::new(store));
        }
        #[cfg(not(feature = "storage-postgres"))]
        {
            let _ = database_url;
            warn!(
                "Persistent storage requested via --database-url, but 'storage-postgres' feature is not enabled. Falling back to In-Memory storage."
            );
        }
    }

    if let Some(db_path) = &cli.db_path {
        #[cfg(feature = "storage-rocksdb")]
        {
            let store = RocksDBStore::open_with_lock_timeout(db_path, lock_timeout)?;
            info!(path = %db_path.display(), "using RocksDB storage");
            return Ok(Box::new(store));
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        {
            let _ = db_path;
            warn!(
                "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
        }
    }

    Ok(Box::new(
        InMemoryLedgerStore::new().with_lock_timeout(lock_timeout),
    ))
}

async fn seed_accounts(ledger: &EnergyLedger, path: &Path) -> Result<()> {
    let file = File::open(path).into_diagnostic()?;
    for record in AccountReader::new(file).accounts() {
        match record {
            Ok(seed) => match ledger.open_account(seed.id, seed.energy).await {
                Ok(account) => {
                    debug!(account_id = %account.id, energy = %account.energy, "account opened")
                }
                Err(LedgerError::Store(StoreError::DuplicateKey(_))) => {
                    info!(account_id = %seed.id, "account already exists, skipping");
                }
                Err(e) => {
                    warn!(account_id = %seed.id, error = %e, "could not open account");
                }
            },
            Err(e) => {
                eprintln!("Error reading account: {}", e);
            }
        }
    }
    Ok(())
}
