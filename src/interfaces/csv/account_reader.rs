use crate::domain::account::AccountId;
use serde::Deserialize;
use std::io::Read;

/// An opening balance from the accounts file (`id,energy`).
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: AccountId,
    pub energy: i64,
}

/// Reads account seeds from a CSV source.
pub struct AccountReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> AccountReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    pub fn accounts(self) -> impl Iterator<Item = csv::Result<AccountRecord>> {
        self.reader.into_deserialize()
    }
}
