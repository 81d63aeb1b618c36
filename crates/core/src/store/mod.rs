//! Contracts for the remote rewards service.
//!
//! The service is split at three seams: the balance/ledger tables, the change
//! feed, and the watch-session RPCs. HTTP and in-memory implementations
//! provide all three.

mod memory;

use async_trait::async_trait;

use crate::errors::Result;
use crate::rewards::{BalanceRow, BalanceUpdate, NewTransaction, Transaction, TransactionKind};
use crate::sync::{ChangeStream, ChangeTable};
use crate::watch::{InteractionAward, InteractionKind, WatchSessionHandle, WatchTimeUpdate};

pub use memory::{InMemoryRewardsStore, InjectedFailure};

#[async_trait]
pub trait RewardsStoreTrait: Send + Sync {
    /// Returns `None` when the user has no balance row yet.
    async fn read_balance(&self, user_id: &str) -> Result<Option<BalanceRow>>;

    /// Creates a zero balance. Idempotent: an existing row is returned as is.
    async fn create_balance(&self, user_id: &str) -> Result<BalanceRow>;

    /// Adjusts the balance and appends the ledger entry in one remote call.
    ///
    /// Fails with `Error::Unsupported` when the remote has no atomic
    /// operation; callers fall back to the composite path.
    async fn atomic_adjust_balance(
        &self,
        user_id: &str,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<BalanceRow>;

    /// Overwrites balance fields. Fails with `Error::Unsupported` when a
    /// written column does not exist remotely.
    async fn write_balance(&self, user_id: &str, update: &BalanceUpdate) -> Result<()>;

    async fn append_transaction(&self, entry: &NewTransaction) -> Result<Transaction>;

    /// Newest first.
    async fn list_transactions(&self, user_id: &str, limit: usize) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait ChangeFeedTrait: Send + Sync {
    /// Opens a push subscription to `table` rows owned by `user_id`.
    async fn subscribe_changes(&self, user_id: &str, table: ChangeTable) -> Result<ChangeStream>;
}

#[async_trait]
pub trait WatchSessionStoreTrait: Send + Sync {
    /// Resumes the open session for the key, or creates one.
    async fn get_or_create_watch_session(
        &self,
        broadcast_id: &str,
        viewer_id: &str,
    ) -> Result<WatchSessionHandle>;

    /// Converts `seconds` into points at the server rate.
    async fn update_watch_time(
        &self,
        session_id: &str,
        viewer_id: &str,
        seconds: u64,
    ) -> Result<WatchTimeUpdate>;

    async fn award_interaction(
        &self,
        session_id: &str,
        viewer_id: &str,
        kind: InteractionKind,
    ) -> Result<InteractionAward>;

    async fn close_watch_session(&self, session_id: &str, viewer_id: &str) -> Result<()>;
}
