pub mod csv;
pub mod transport;
