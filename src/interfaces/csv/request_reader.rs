use crate::interfaces::transport::{ConsumeRequest, Field};
use serde::Deserialize;
use std::io::Read;

/// One raw row of the requests file. Every column is kept as text so that
/// validation, and its error messages, stay in the transport adapter.
#[derive(Debug, Deserialize)]
struct RequestRecord {
    account_id: Option<String>,
    amount: Option<String>,
    idempotency_key: Option<String>,
}

impl From<RequestRecord> for ConsumeRequest {
    fn from(record: RequestRecord) -> Self {
        Self {
            account_id: record.account_id.map(Field::Text),
            amount: record.amount.map(Field::Text),
            idempotency_key: record.idempotency_key.map(Field::Text),
        }
    }
}

/// Reads consume requests from a CSV source with an
/// `account_id,amount,idempotency_key` header.
///
/// Rows whose column count differs from the header are reported as errors
/// and do not stop the stream.
pub struct RequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> RequestReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily yields one request per row.
    pub fn requests(self) -> impl Iterator<Item = csv::Result<ConsumeRequest>> {
        self.reader
            .into_deserialize::<RequestRecord>()
            .map(|result| result.map(ConsumeRequest::from))
    }
}
