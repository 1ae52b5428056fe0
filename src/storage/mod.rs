//! Store accessor contract and backends.

pub mod memory;
pub mod sql;
pub mod traits;
