//! In-memory balance state shared by every UI surface of one user.

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::watch;

use super::rewards_model::Balance;

/// Observable balance state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceState {
    /// `None` until the first fetch or optimistic mutation.
    pub balance: Option<Balance>,
    /// Optimistic mutations applied locally and not yet settled.
    pub pending_mutations: u32,
    /// Incremented on every authoritative replacement.
    pub version: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl BalanceState {
    pub fn is_optimistic(&self) -> bool {
        self.pending_mutations > 0
    }
}

/// Receipt for an optimistic delta, needed to settle or discard it.
#[derive(Debug)]
#[must_use = "optimistic updates must be settled or discarded"]
pub struct OptimisticTicket {
    delta: i64,
    base_version: u64,
}

impl OptimisticTicket {
    pub fn delta(&self) -> i64 {
        self.delta
    }
}

/// Authoritative-or-optimistic balance for one user.
///
/// Authoritative rows replace state wholesale; optimistic deltas are layered
/// on top until the next replacement supersedes them.
#[derive(Debug)]
pub struct BalanceStore {
    user_id: String,
    sender: watch::Sender<BalanceState>,
}

impl BalanceStore {
    pub fn new(user_id: &str) -> Self {
        let (sender, _) = watch::channel(BalanceState::default());
        Self {
            user_id: user_id.to_string(),
            sender,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn snapshot(&self) -> BalanceState {
        self.sender.borrow().clone()
    }

    pub fn balance(&self) -> Option<Balance> {
        self.sender.borrow().balance.clone()
    }

    /// Spendable points as currently displayed; 0 before the first load.
    pub fn available_points(&self) -> i64 {
        self.sender
            .borrow()
            .balance
            .as_ref()
            .map(|b| b.points)
            .unwrap_or(0)
    }

    /// Authoritative replacement count; also bumped by `clear`.
    pub fn version(&self) -> u64 {
        self.sender.borrow().version
    }

    /// Layers already-confirmed points on top of the current state, but only
    /// when nothing replaced or cleared it since `since_version`.
    pub fn credit_since(&self, points: i64, since_version: u64) -> bool {
        let mut applied = false;
        self.sender.send_if_modified(|state| {
            if state.version != since_version {
                return false;
            }
            match state.balance.as_mut() {
                Some(balance) if balance.can_apply(points) => {
                    balance.apply_delta(points);
                    applied = true;
                    true
                }
                _ => false,
            }
        });
        applied
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<BalanceState> {
        self.sender.subscribe()
    }

    pub fn apply_optimistic(&self, delta: i64) -> OptimisticTicket {
        let mut base_version = 0;
        let user_id = self.user_id.clone();
        self.sender.send_modify(|state| {
            let balance = state
                .balance
                .get_or_insert_with(|| Balance::empty(&user_id));
            balance.apply_delta(delta);
            state.pending_mutations += 1;
            base_version = state.version;
        });
        debug!(
            "[Rewards] Optimistic delta {} applied for {} (base version {})",
            delta, self.user_id, base_version
        );
        OptimisticTicket {
            delta,
            base_version,
        }
    }

    /// Marks a mutation as confirmed; the optimistic value stays until the
    /// next authoritative replacement.
    pub fn settle(&self, _ticket: OptimisticTicket) {
        self.sender.send_modify(|state| {
            state.pending_mutations = state.pending_mutations.saturating_sub(1);
        });
    }

    /// Reverses a failed optimistic delta unless an authoritative row has
    /// already replaced it.
    pub fn discard(&self, ticket: OptimisticTicket) {
        self.sender.send_modify(|state| {
            state.pending_mutations = state.pending_mutations.saturating_sub(1);
            if state.version == ticket.base_version {
                if let Some(balance) = state.balance.as_mut() {
                    balance.revert_delta(ticket.delta);
                }
            }
        });
    }

    /// Replaces local state with an authoritative balance.
    pub fn replace(&self, balance: Balance) {
        self.sender.send_modify(|state| {
            state.balance = Some(balance);
            state.version += 1;
            state.last_synced_at = Some(Utc::now());
        });
    }

    /// Forgets everything; used on sign-out.
    pub fn clear(&self) {
        self.sender.send_modify(|state| {
            *state = BalanceState {
                version: state.version + 1,
                ..BalanceState::default()
            };
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewards::Tier;

    fn authoritative(points: i64, earned: i64, spent: i64) -> Balance {
        Balance {
            user_id: "u1".to_string(),
            points,
            total_earned: earned,
            total_spent: spent,
            tier: crate::rewards::classify_tier(earned),
            updated_at: None,
        }
    }

    #[test]
    fn optimistic_delta_then_settle() {
        let store = BalanceStore::new("u1");
        store.replace(authoritative(100, 100, 0));
        let ticket = store.apply_optimistic(50);
        assert!(store.snapshot().is_optimistic());
        assert_eq!(store.available_points(), 150);
        store.settle(ticket);
        assert!(!store.snapshot().is_optimistic());
        assert_eq!(store.available_points(), 150);
    }

    #[test]
    fn discard_reverts_only_its_own_delta() {
        let store = BalanceStore::new("u1");
        store.replace(authoritative(100, 100, 0));
        let first = store.apply_optimistic(30);
        let second = store.apply_optimistic(-20);
        store.discard(first);
        let balance = store.balance().unwrap();
        assert_eq!(balance.points, 80);
        assert_eq!(balance.total_earned, 100);
        assert_eq!(balance.total_spent, 20);
        store.settle(second);
    }

    #[test]
    fn discard_after_replace_keeps_authoritative_value() {
        let store = BalanceStore::new("u1");
        store.replace(authoritative(100, 100, 0));
        let ticket = store.apply_optimistic(900);
        assert_eq!(store.balance().unwrap().tier, Tier::Silver);
        store.replace(authoritative(500, 500, 0));
        store.discard(ticket);
        assert_eq!(store.balance().unwrap(), authoritative(500, 500, 0));
        assert_eq!(store.snapshot().pending_mutations, 0);
    }

    #[test]
    fn observers_see_replacements() {
        let store = BalanceStore::new("u1");
        let mut rx = store.subscribe();
        store.replace(authoritative(7, 7, 0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().balance.as_ref().unwrap().points, 7);
        store.clear();
        assert!(rx.borrow_and_update().balance.is_none());
    }

    #[test]
    fn credit_is_skipped_after_replace_or_clear() {
        let store = BalanceStore::new("u1");
        store.replace(authoritative(100, 100, 0));
        let base = store.version();
        assert!(store.credit_since(5, base));
        assert_eq!(store.available_points(), 105);

        let stale = store.version();
        store.replace(authoritative(105, 105, 0));
        assert!(!store.credit_since(5, stale));
        assert_eq!(store.available_points(), 105);

        let before_clear = store.version();
        store.clear();
        assert!(!store.credit_since(5, before_clear));
        assert!(!store.credit_since(5, store.version()));
        assert!(store.balance().is_none());
    }

    #[test]
    fn optimistic_on_unloaded_store_starts_from_zero() {
        let store = BalanceStore::new("u9");
        let ticket = store.apply_optimistic(10);
        assert_eq!(store.balance().unwrap().user_id, "u9");
        store.discard(ticket);
        assert_eq!(store.available_points(), 0);
    }
}
