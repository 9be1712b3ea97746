//! Application layer orchestrating the store primitives.
//!
//! This module defines the `EnergyLedger`, the entry point for consuming
//! energy. It holds no state of its own: every guarantee it gives comes from
//! running the store's lock, insert and debit primitives inside one unit of
//! work.

pub mod ledger;
