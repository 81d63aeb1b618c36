//! Change-feed and subscription status models.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::rewards::{BalanceRow, Transaction};

/// Remote tables the change feed can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    Balances,
    Transactions,
}

impl ChangeTable {
    pub fn table_name(self) -> &'static str {
        match self {
            ChangeTable::Balances => "user_points",
            ChangeTable::Transactions => "points_transactions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row carried by a change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    Balance(BalanceRow),
    Transaction(Transaction),
}

/// One server-pushed row change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: ChangeRecord,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn balance(kind: ChangeKind, row: BalanceRow) -> Self {
        Self {
            kind,
            record: ChangeRecord::Balance(row),
            commit_timestamp: None,
        }
    }

    pub fn transaction(kind: ChangeKind, transaction: Transaction) -> Self {
        Self {
            kind,
            record: ChangeRecord::Transaction(transaction),
            commit_timestamp: None,
        }
    }
}

/// Stream returned by a change-feed subscription. Ends when the remote
/// closes the channel; an `Err` item means the channel broke.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Lifecycle of one user's balance subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "attempt")]
pub enum SyncStatus {
    Connecting,
    Connected,
    /// Waiting to retry after `n` consecutive failures.
    Retrying(u32),
    /// Push channel abandoned for the rest of the session.
    Polling,
    Stopped,
}

impl SyncStatus {
    pub fn is_push_active(self) -> bool {
        matches!(self, SyncStatus::Connected)
    }
}
