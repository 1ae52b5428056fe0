//! Issue ledger: persistence of issues, reports and transaction records.

pub mod memory;
pub mod sql;
pub mod traits;
