#[macro_use]
pub mod common;
pub mod ledger;
