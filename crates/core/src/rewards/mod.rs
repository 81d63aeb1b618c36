//! Rewards balance, ledger, and tier domain.

mod balance_store;
mod ledger_writer;
mod rewards_model;
mod tier;

pub use balance_store::*;
pub use ledger_writer::*;
pub use rewards_model::*;
pub use tier::*;
