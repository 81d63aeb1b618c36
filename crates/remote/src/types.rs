//! Wire types for the rewards backend.

use chrono::{DateTime, Utc};
use pointsync_core::rewards::{NewTransaction, Transaction, TransactionKind};
use pointsync_core::sync::ChangeKind;
use pointsync_core::watch::{
    InteractionAward, InteractionKind, WatchSessionHandle, WatchTimeUpdate,
};
use serde::{Deserialize, Serialize};

pub const BALANCES_TABLE: &str = "user_points";
pub const TRANSACTIONS_TABLE: &str = "points_transactions";

pub const RPC_ADJUST_POINTS: &str = "adjust_user_points";
pub const RPC_GET_OR_CREATE_WATCH_SESSION: &str = "get_or_create_watch_session";
pub const RPC_UPDATE_WATCH_TIME: &str = "update_watch_time";
pub const RPC_AWARD_INTERACTION: &str = "award_interaction_points";
pub const RPC_CLOSE_WATCH_SESSION: &str = "close_watch_session";

/// Error body returned by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

/// RPCs declared `returns table` answer with an array, scalar-record ones
/// with an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_first(self) -> Option<T> {
        match self {
            OneOrMany::Many(items) => items.into_iter().next(),
            OneOrMany::One(item) => Some(item),
        }
    }
}

/// `points_transactions` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub id: String,
    pub user_id: String,
    pub points: i64,
    pub transaction_type: TransactionKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        Transaction {
            id: row.id,
            user_id: row.user_id,
            delta: row.points,
            kind: row.transaction_type,
            description: row.description.unwrap_or_default(),
            reference_id: row.reference_id,
            created_at: row.created_at,
        }
    }
}

/// Insert body for `points_transactions`.
#[derive(Debug, Clone, Serialize)]
pub struct NewTransactionRow<'a> {
    pub user_id: &'a str,
    pub points: i64,
    pub transaction_type: TransactionKind,
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<&'a str>,
}

impl<'a> From<&'a NewTransaction> for NewTransactionRow<'a> {
    fn from(entry: &'a NewTransaction) -> Self {
        Self {
            user_id: &entry.user_id,
            points: entry.delta,
            transaction_type: entry.kind,
            description: &entry.description,
            reference_id: entry.reference_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustPointsParams<'a> {
    pub p_user_id: &'a str,
    pub p_points: i64,
    pub p_transaction_type: TransactionKind,
    pub p_description: &'a str,
    pub p_reference_id: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchSessionParams<'a> {
    pub p_broadcast_id: &'a str,
    pub p_viewer_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchTimeParams<'a> {
    pub p_session_id: &'a str,
    pub p_viewer_id: &'a str,
    pub p_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractionParams<'a> {
    pub p_session_id: &'a str,
    pub p_viewer_id: &'a str,
    pub p_interaction_type: InteractionKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseSessionParams<'a> {
    pub p_session_id: &'a str,
    pub p_viewer_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub is_new: bool,
}

impl From<WatchSessionResponse> for WatchSessionHandle {
    fn from(response: WatchSessionResponse) -> Self {
        WatchSessionHandle {
            session_id: response.session_id,
            is_new: response.is_new,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchTimeResponse {
    #[serde(default)]
    pub points_earned: i64,
    #[serde(default)]
    pub total_points: i64,
    #[serde(default)]
    pub total_watch_seconds: i64,
}

impl From<WatchTimeResponse> for WatchTimeUpdate {
    fn from(response: WatchTimeResponse) -> Self {
        WatchTimeUpdate {
            points_earned: response.points_earned,
            total_points: response.total_points,
            total_watch_seconds: response.total_watch_seconds,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InteractionResponse {
    #[serde(default)]
    pub points_earned: i64,
}

impl From<InteractionResponse> for InteractionAward {
    fn from(response: InteractionResponse) -> Self {
        InteractionAward {
            points_earned: response.points_earned,
        }
    }
}

/// Data payload of one server-sent change event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub event_type: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
    #[serde(default, alias = "commit_timestamp")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_result_accepts_array_or_object() {
        let many: OneOrMany<WatchSessionResponse> =
            serde_json::from_str(r#"[{"session_id":"s1","is_new":true}]"#).unwrap();
        assert_eq!(many.into_first().unwrap().session_id, "s1");

        let one: OneOrMany<WatchTimeResponse> =
            serde_json::from_str(r#"{"points_earned":3,"total_points":7,"total_watch_seconds":70}"#)
                .unwrap();
        assert_eq!(WatchTimeUpdate::from(one.into_first().unwrap()).total_points, 7);
    }

    #[test]
    fn transaction_row_maps_wire_columns() {
        let row: TransactionRow = serde_json::from_str(
            r#"{"id":"t1","user_id":"u1","points":-40,"transaction_type":"redemption",
                "description":null,"created_at":"2026-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        let tx = Transaction::from(row);
        assert_eq!(tx.delta, -40);
        assert_eq!(tx.kind, TransactionKind::Redemption);
        assert_eq!(tx.description, "");
    }
}
