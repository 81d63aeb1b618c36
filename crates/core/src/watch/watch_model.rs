//! Watch-session models for live-broadcast point accrual.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local ticker cadence in seconds.
pub const WATCH_TICK_INTERVAL_SECS: u64 = 10;

/// Accumulated seconds that trigger a server flush.
pub const WATCH_FLUSH_THRESHOLD_SECS: u64 = 30;

/// Discrete viewer actions that earn bonus points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Message,
    Reaction,
    Purchase,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::Message => "message",
            InteractionKind::Reaction => "reaction",
            InteractionKind::Purchase => "purchase",
        }
    }
}

/// Server record of one viewer's presence in one broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSession {
    pub id: String,
    pub broadcast_id: String,
    pub viewer_id: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub accumulated_watch_seconds: i64,
    pub points_from_watching: i64,
    pub points_from_messages: i64,
    pub points_from_reactions: i64,
    pub points_from_purchase: i64,
    pub message_count: i64,
    pub reaction_count: i64,
    pub purchased: bool,
}

impl WatchSession {
    pub fn is_open(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn total_points(&self) -> i64 {
        self.points_from_watching
            + self.points_from_messages
            + self.points_from_reactions
            + self.points_from_purchase
    }
}

/// Result of get-or-create on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSessionHandle {
    pub session_id: String,
    pub is_new: bool,
}

/// Server response to a watch-time flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTimeUpdate {
    pub points_earned: i64,
    pub total_points: i64,
    pub total_watch_seconds: i64,
}

/// Server response to an interaction award.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionAward {
    pub points_earned: i64,
}

/// Tracker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchPhase {
    Init,
    Active,
    Ended,
}

/// Client-side aggregate of what this viewing earned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSummary {
    pub session_id: String,
    /// Seconds acknowledged by the server through flushes.
    pub flushed_seconds: u64,
    /// Seconds accumulated locally and not yet acknowledged.
    pub pending_seconds: u64,
    pub flush_count: u32,
    pub points_from_watching: i64,
    pub points_from_messages: i64,
    pub points_from_reactions: i64,
    pub points_from_purchase: i64,
    pub message_count: u32,
    pub reaction_count: u32,
    pub purchased: bool,
}

impl WatchSummary {
    pub fn total_points(&self) -> i64 {
        self.points_from_watching
            + self.points_from_messages
            + self.points_from_reactions
            + self.points_from_purchase
    }
}
