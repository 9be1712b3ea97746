//! CSV adapters for the batch CLI: seed accounts, read consume requests and
//! write one outcome row per request.

pub mod account_reader;
pub mod outcome_writer;
pub mod request_reader;
