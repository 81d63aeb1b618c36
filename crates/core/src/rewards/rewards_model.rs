//! Balance and ledger domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tier::{classify_tier, Tier};

/// Category of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Review,
    Referral,
    Redemption,
    Bonus,
    Welcome,
    WatchTime,
    Interaction,
    #[serde(other)]
    Other,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Review => "review",
            TransactionKind::Referral => "referral",
            TransactionKind::Redemption => "redemption",
            TransactionKind::Bonus => "bonus",
            TransactionKind::Welcome => "welcome",
            TransactionKind::WatchTime => "watch_time",
            TransactionKind::Interaction => "interaction",
            TransactionKind::Other => "other",
        }
    }
}

/// Balance row as the remote store returns it.
///
/// Lifetime columns and tier are optional because older schemas do not carry
/// them; `Balance::from_row` derives whatever is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub user_id: String,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub total_earned: Option<i64>,
    #[serde(default)]
    pub total_spent: Option<i64>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BalanceRow {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            points: 0,
            total_earned: Some(0),
            total_spent: Some(0),
            tier: Some(Tier::Bronze.to_string()),
            updated_at: None,
        }
    }
}

/// One user's spendable and lifetime point totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub user_id: String,
    pub points: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub tier: Tier,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Balance {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            points: 0,
            total_earned: 0,
            total_spent: 0,
            tier: Tier::Bronze,
            updated_at: None,
        }
    }

    /// Normalises a possibly reduced row into a full balance.
    pub fn from_row(row: BalanceRow) -> Self {
        let (total_earned, total_spent) = match (row.total_earned, row.total_spent) {
            (Some(earned), Some(spent)) => (earned, spent),
            (Some(earned), None) => (earned, (earned - row.points).max(0)),
            (None, Some(spent)) => (row.points + spent, spent),
            (None, None) => (row.points.max(0), 0),
        };
        let tier = row
            .tier
            .as_deref()
            .and_then(|value| value.parse::<Tier>().ok())
            .unwrap_or_else(|| classify_tier(total_earned));
        Self {
            user_id: row.user_id,
            points: row.points,
            total_earned,
            total_spent,
            tier,
            updated_at: row.updated_at,
        }
    }

    /// True when `points == total_earned - total_spent`.
    pub fn is_consistent(&self) -> bool {
        self.points == self.total_earned - self.total_spent
    }

    /// Applies a signed delta the way the ledger does: credits raise lifetime
    /// earned, debits raise lifetime spent. Tier never decreases.
    /// Saturates instead of overflowing; callers reject such deltas up front
    /// with `can_apply`.
    pub fn apply_delta(&mut self, delta: i64) {
        self.points = self.points.saturating_add(delta);
        if delta >= 0 {
            self.total_earned = self.total_earned.saturating_add(delta);
        } else {
            self.total_spent = self.total_spent.saturating_sub(delta);
        }
        self.tier = self.tier.max(classify_tier(self.total_earned));
    }

    /// False when `delta` would overflow the balance or a lifetime total.
    pub fn can_apply(&self, delta: i64) -> bool {
        let lifetime = if delta >= 0 {
            self.total_earned.checked_add(delta)
        } else {
            self.total_spent.checked_sub(delta)
        };
        self.points.checked_add(delta).is_some() && lifetime.is_some()
    }

    /// Reverses `apply_delta`. A reverted credit recomputes tier from the
    /// restored lifetime total; a reverted debit leaves tier alone.
    pub fn revert_delta(&mut self, delta: i64) {
        self.points = self.points.saturating_sub(delta);
        if delta >= 0 {
            self.total_earned = self.total_earned.saturating_sub(delta);
            self.tier = classify_tier(self.total_earned);
        } else {
            self.total_spent = self.total_spent.saturating_add(delta);
        }
    }
}

/// Field set written on the non-atomic fallback path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub points: i64,
    pub total_earned: i64,
    /// Omitted when the remote schema has no lifetime-spent column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_spent: Option<i64>,
    pub tier: Tier,
}

impl BalanceUpdate {
    pub fn from_balance(balance: &Balance) -> Self {
        Self {
            points: balance.points,
            total_earned: balance.total_earned,
            total_spent: Some(balance.total_spent),
            tier: balance.tier,
        }
    }

    pub fn without_total_spent(mut self) -> Self {
        self.total_spent = None;
        self
    }
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub delta: i64,
    pub kind: TransactionKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry before the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub user_id: String,
    pub delta: i64,
    pub kind: TransactionKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(points: i64, earned: Option<i64>, spent: Option<i64>) -> BalanceRow {
        BalanceRow {
            user_id: "u1".to_string(),
            points,
            total_earned: earned,
            total_spent: spent,
            tier: None,
            updated_at: None,
        }
    }

    #[test]
    fn from_row_keeps_full_rows() {
        let balance = Balance::from_row(row(300, Some(1_200), Some(900)));
        assert_eq!(balance.points, 300);
        assert_eq!(balance.total_earned, 1_200);
        assert_eq!(balance.total_spent, 900);
        assert_eq!(balance.tier, Tier::Silver);
        assert!(balance.is_consistent());
    }

    #[test]
    fn overflowing_delta_is_refused() {
        let mut balance = Balance::from_row(row(10, Some(10), Some(0)));
        assert!(!balance.can_apply(i64::MAX));
        assert!(balance.can_apply(1_000));
        balance.apply_delta(i64::MAX);
        assert_eq!(balance.points, i64::MAX);
    }

    #[test]
    fn from_row_derives_missing_lifetime_spent() {
        let balance = Balance::from_row(row(300, Some(500), None));
        assert_eq!(balance.total_spent, 200);
        assert!(balance.is_consistent());
    }

    #[test]
    fn from_row_derives_missing_lifetime_earned() {
        let balance = Balance::from_row(row(300, None, Some(100)));
        assert_eq!(balance.total_earned, 400);

        let bare = Balance::from_row(row(42, None, None));
        assert_eq!(bare.total_earned, 42);
        assert_eq!(bare.total_spent, 0);
    }

    #[test]
    fn from_row_prefers_remote_tier_when_recognised() {
        let mut with_tier = row(10, Some(10), Some(0));
        with_tier.tier = Some("Gold".to_string());
        assert_eq!(Balance::from_row(with_tier).tier, Tier::Gold);

        let mut unknown = row(10, Some(10), Some(0));
        unknown.tier = Some("diamond".to_string());
        assert_eq!(Balance::from_row(unknown).tier, Tier::Bronze);
    }

    #[test]
    fn spending_never_lowers_tier() {
        let mut balance = Balance::empty("u1");
        balance.apply_delta(1_000);
        assert_eq!(balance.tier, Tier::Silver);
        balance.apply_delta(-900);
        assert_eq!(balance.tier, Tier::Silver);
        assert_eq!(balance.points, 100);
        assert_eq!(balance.total_spent, 900);
        assert!(balance.is_consistent());
    }

    #[test]
    fn revert_delta_restores_previous_totals() {
        let mut balance = Balance::empty("u1");
        balance.apply_delta(200);
        balance.apply_delta(-50);
        balance.revert_delta(-50);
        assert_eq!(balance.points, 200);
        assert_eq!(balance.total_spent, 0);
        balance.revert_delta(200);
        assert_eq!(balance, Balance::empty("u1"));
    }

    #[test]
    fn balance_update_omits_missing_column() {
        let mut balance = Balance::empty("u1");
        balance.apply_delta(5);
        let update = BalanceUpdate::from_balance(&balance).without_total_spent();
        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("total_spent").is_none());
        assert_eq!(json["points"], 5);
        assert_eq!(json["tier"], "bronze");
    }

    #[test]
    fn unknown_transaction_kind_maps_to_other() {
        let kind: TransactionKind = serde_json::from_str("\"streak_bonus\"").unwrap();
        assert_eq!(kind, TransactionKind::Other);
        let kind: TransactionKind = serde_json::from_str("\"watch_time\"").unwrap();
        assert_eq!(kind, TransactionKind::WatchTime);
    }
}
