use crate::interfaces::transport::Response;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;

/// One line of the outcome report.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub idempotency_key: String,
    pub status: u16,
    pub remaining_energy: Option<i64>,
    pub message: Option<String>,
}

impl OutcomeRecord {
    /// Flattens a transport response into a report row.
    pub fn new(idempotency_key: impl Into<String>, response: &Response) -> Self {
        let text = |field: &str| response.body.get(field).and_then(Value::as_str).map(String::from);
        Self {
            idempotency_key: idempotency_key.into(),
            status: response.status.code(),
            remaining_energy: response.body.get("remaining_energy").and_then(Value::as_i64),
            message: text("error").or_else(|| text("message")),
        }
    }
}

/// Writes outcome rows as CSV (`idempotency_key,status,remaining_energy,message`).
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write(&mut self, record: &OutcomeRecord) -> csv::Result<()> {
        self.writer.serialize(record)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
