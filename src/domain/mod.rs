//! Domain types and the storage ports the ledger runs against.

pub mod account;
pub mod consumption;
pub mod ports;
