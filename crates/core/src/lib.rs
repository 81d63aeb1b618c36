//! Rewards ledger with optimistic balances and real-time sync.
//!
//! Remote access goes through the traits in [`store`]; `pointsync-remote`
//! provides the HTTP implementation and [`store::InMemoryRewardsStore`] an
//! in-process one.

pub mod config;
pub mod errors;
pub mod rewards;
pub mod session;
pub mod store;
pub mod sync;
pub mod watch;

pub use errors::{Error, Result};
pub use session::{BalanceAccessor, RewardsSession, RewardsStores};
