//! Storage adapters implementing [`crate::domain::ports::LedgerStore`].

/// Largest lock timeout every adapter can honor. PostgreSQL stores
/// `lock_timeout` as a 32-bit millisecond count.
pub const MAX_LOCK_TIMEOUT_MS: u64 = i32::MAX as u64;

pub mod in_memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
