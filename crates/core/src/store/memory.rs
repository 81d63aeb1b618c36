//! In-process rewards store.
//!
//! Behaves like the hosted backend: writes emit change events to open
//! subscriptions, watch-time and interaction RPCs credit the viewer's ledger.
//! Capability switches and one-shot failure injection let callers exercise
//! the degraded paths.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ChangeFeedTrait, RewardsStoreTrait, WatchSessionStoreTrait};
use crate::errors::{Error, Result};
use crate::rewards::{
    classify_tier, BalanceRow, BalanceUpdate, NewTransaction, Transaction, TransactionKind,
};
use crate::sync::{ChangeEvent, ChangeKind, ChangeStream, ChangeTable};
use crate::watch::{
    InteractionAward, InteractionKind, WatchSession, WatchSessionHandle, WatchTimeUpdate,
};

const DEFAULT_SECONDS_PER_POINT: i64 = 10;
const MESSAGE_POINTS: i64 = 2;
const REACTION_POINTS: i64 = 1;
const PURCHASE_POINTS: i64 = 50;

/// Failure to inject into the next call of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Rejected,
    Unsupported,
}

impl InjectedFailure {
    fn into_error(self, op: &str) -> Error {
        match self {
            InjectedFailure::Transient => Error::transient(format!("{} timed out", op)),
            InjectedFailure::Rejected => Error::rejected(format!("{} rejected", op)),
            InjectedFailure::Unsupported => Error::unsupported(format!("{} unavailable", op)),
        }
    }
}

struct FeedSubscriber {
    user_id: String,
    table: ChangeTable,
    sender: mpsc::UnboundedSender<Result<ChangeEvent>>,
}

struct StoreState {
    balances: HashMap<String, BalanceRow>,
    transactions: Vec<Transaction>,
    sessions: HashMap<String, WatchSession>,
    subscribers: Vec<FeedSubscriber>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<InjectedFailure>>,
    atomic_supported: bool,
    total_spent_supported: bool,
    feed_available: bool,
    seconds_per_point: i64,
}

/// Shared, cloneable in-memory implementation of every store trait.
#[derive(Clone)]
pub struct InMemoryRewardsStore {
    state: Arc<Mutex<StoreState>>,
}

impl Default for InMemoryRewardsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRewardsStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                balances: HashMap::new(),
                transactions: Vec::new(),
                sessions: HashMap::new(),
                subscribers: Vec::new(),
                calls: HashMap::new(),
                failures: HashMap::new(),
                atomic_supported: true,
                total_spent_supported: true,
                feed_available: true,
                seconds_per_point: DEFAULT_SECONDS_PER_POINT,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A poisoned lock only means a test thread panicked mid-call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Disables the atomic adjust RPC.
    pub fn without_atomic_adjust(self) -> Self {
        self.lock().atomic_supported = false;
        self
    }

    /// Drops the lifetime-spent column from the schema.
    pub fn without_total_spent(self) -> Self {
        {
            let mut state = self.lock();
            state.total_spent_supported = false;
            for row in state.balances.values_mut() {
                row.total_spent = None;
            }
        }
        self
    }

    pub fn with_seconds_per_point(self, seconds: i64) -> Self {
        self.lock().seconds_per_point = seconds.max(1);
        self
    }

    /// Makes every subscribe attempt fail while `available` is false.
    pub fn set_feed_available(&self, available: bool) {
        self.lock().feed_available = available;
    }

    /// Fails the next call of `op` with `failure`.
    pub fn fail_next(&self, op: &'static str, failure: InjectedFailure) {
        self.lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Seeds a balance row without emitting change events.
    pub fn seed_balance(&self, row: BalanceRow) {
        let mut state = self.lock();
        let mut row = row;
        if !state.total_spent_supported {
            row.total_spent = None;
        }
        state.balances.insert(row.user_id.clone(), row);
    }

    pub fn balance_row(&self, user_id: &str) -> Option<BalanceRow> {
        self.lock().balances.get(user_id).cloned()
    }

    pub fn transactions_for(&self, user_id: &str) -> Vec<Transaction> {
        self.lock()
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn session(&self, session_id: &str) -> Option<WatchSession> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of open subscriber channels for the user.
    pub fn active_subscriptions(&self, user_id: &str) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.sender.is_closed());
        state
            .subscribers
            .iter()
            .filter(|s| s.user_id == user_id)
            .count()
    }

    /// Pushes an event to the user's subscribers as if the backend emitted it.
    pub fn emit(&self, user_id: &str, event: ChangeEvent) {
        let mut state = self.lock();
        Self::publish(&mut state, user_id, event);
    }

    /// Breaks every open channel for the user with a transport error.
    pub fn break_feed(&self, user_id: &str) {
        let mut state = self.lock();
        state.subscribers.retain(|s| {
            if s.user_id == user_id {
                let _ = s.sender.send(Err(Error::subscription("channel error")));
                false
            } else {
                true
            }
        });
    }

    fn enter(&self, op: &'static str) -> Result<MutexGuard<'_, StoreState>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(failure) = state.failures.get_mut(op).and_then(|q| q.pop_front()) {
            return Err(failure.into_error(op));
        }
        Ok(state)
    }

    fn publish(state: &mut StoreState, user_id: &str, event: ChangeEvent) {
        let table = match &event.record {
            crate::sync::ChangeRecord::Balance(_) => ChangeTable::Balances,
            crate::sync::ChangeRecord::Transaction(_) => ChangeTable::Transactions,
        };
        state.subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in &state.subscribers {
            if subscriber.user_id == user_id && subscriber.table == table {
                let _ = subscriber.sender.send(Ok(event.clone()));
            }
        }
    }

    fn ensure_row(state: &mut StoreState, user_id: &str) -> (BalanceRow, bool) {
        if let Some(row) = state.balances.get(user_id) {
            return (row.clone(), false);
        }
        let mut row = BalanceRow::new(user_id);
        row.updated_at = Some(Utc::now());
        if !state.total_spent_supported {
            row.total_spent = None;
        }
        state.balances.insert(user_id.to_string(), row.clone());
        (row, true)
    }

    /// Applies a delta server-side: balance row, ledger entry, change events.
    fn adjust(
        state: &mut StoreState,
        user_id: &str,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<BalanceRow> {
        let (mut row, _) = Self::ensure_row(state, user_id);
        if row.points + delta < 0 {
            return Err(Error::rejected(format!(
                "balance for {} cannot go negative",
                user_id
            )));
        }
        row.points += delta;
        let mut earned = row.total_earned.unwrap_or(0);
        if delta >= 0 {
            earned += delta;
        } else if let Some(spent) = row.total_spent.as_mut() {
            *spent += -delta;
        }
        row.total_earned = Some(earned);
        let current_tier = row
            .tier
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or_default();
        row.tier = Some(classify_tier(earned).max(current_tier).to_string());
        row.updated_at = Some(Utc::now());
        state.balances.insert(user_id.to_string(), row.clone());

        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            delta,
            kind,
            description: description.to_string(),
            reference_id: reference_id.map(str::to_string),
            created_at: Utc::now(),
        };
        state.transactions.push(tx.clone());
        Self::publish(
            state,
            user_id,
            ChangeEvent::balance(ChangeKind::Update, row.clone()),
        );
        Self::publish(
            state,
            user_id,
            ChangeEvent::transaction(ChangeKind::Insert, tx),
        );
        Ok(row)
    }

    fn session_mut<'a>(
        state: &'a mut StoreState,
        session_id: &str,
        viewer_id: &str,
    ) -> Result<&'a mut WatchSession> {
        match state.sessions.get_mut(session_id) {
            Some(session) if session.viewer_id == viewer_id => Ok(session),
            Some(_) => Err(Error::rejected("session belongs to another viewer")),
            None => Err(Error::NotFound(format!("watch session {}", session_id))),
        }
    }
}

#[async_trait]
impl RewardsStoreTrait for InMemoryRewardsStore {
    async fn read_balance(&self, user_id: &str) -> Result<Option<BalanceRow>> {
        let state = self.enter("read_balance")?;
        Ok(state.balances.get(user_id).cloned())
    }

    async fn create_balance(&self, user_id: &str) -> Result<BalanceRow> {
        let mut state = self.enter("create_balance")?;
        let (row, created) = Self::ensure_row(&mut state, user_id);
        if created {
            Self::publish(
                &mut state,
                user_id,
                ChangeEvent::balance(ChangeKind::Insert, row.clone()),
            );
        }
        Ok(row)
    }

    async fn atomic_adjust_balance(
        &self,
        user_id: &str,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<BalanceRow> {
        let mut state = self.enter("atomic_adjust_balance")?;
        if !state.atomic_supported {
            return Err(Error::unsupported("adjust_user_points is not deployed"));
        }
        Self::adjust(&mut state, user_id, delta, kind, description, reference_id)
    }

    async fn write_balance(&self, user_id: &str, update: &BalanceUpdate) -> Result<()> {
        let mut state = self.enter("write_balance")?;
        if update.total_spent.is_some() && !state.total_spent_supported {
            return Err(Error::unsupported("column user_points.total_spent"));
        }
        if update.points < 0 {
            return Err(Error::rejected("points must be non-negative"));
        }
        let (mut row, _) = Self::ensure_row(&mut state, user_id);
        row.points = update.points;
        row.total_earned = Some(update.total_earned);
        if update.total_spent.is_some() {
            row.total_spent = update.total_spent;
        }
        row.tier = Some(update.tier.to_string());
        row.updated_at = Some(Utc::now());
        state.balances.insert(user_id.to_string(), row.clone());
        Self::publish(
            &mut state,
            user_id,
            ChangeEvent::balance(ChangeKind::Update, row),
        );
        Ok(())
    }

    async fn append_transaction(&self, entry: &NewTransaction) -> Result<Transaction> {
        let mut state = self.enter("append_transaction")?;
        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            user_id: entry.user_id.clone(),
            delta: entry.delta,
            kind: entry.kind,
            description: entry.description.clone(),
            reference_id: entry.reference_id.clone(),
            created_at: Utc::now(),
        };
        state.transactions.push(tx.clone());
        Self::publish(
            &mut state,
            &entry.user_id,
            ChangeEvent::transaction(ChangeKind::Insert, tx.clone()),
        );
        Ok(tx)
    }

    async fn list_transactions(&self, user_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        let state = self.enter("list_transactions")?;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChangeFeedTrait for InMemoryRewardsStore {
    async fn subscribe_changes(&self, user_id: &str, table: ChangeTable) -> Result<ChangeStream> {
        let mut state = self.enter("subscribe_changes")?;
        if !state.feed_available {
            return Err(Error::subscription("realtime channel timed out"));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(FeedSubscriber {
            user_id: user_id.to_string(),
            table,
            sender,
        });
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl WatchSessionStoreTrait for InMemoryRewardsStore {
    async fn get_or_create_watch_session(
        &self,
        broadcast_id: &str,
        viewer_id: &str,
    ) -> Result<WatchSessionHandle> {
        let mut state = self.enter("get_or_create_watch_session")?;
        if let Some(open) = state.sessions.values().find(|s| {
            s.broadcast_id == broadcast_id && s.viewer_id == viewer_id && s.is_open()
        }) {
            return Ok(WatchSessionHandle {
                session_id: open.id.clone(),
                is_new: false,
            });
        }
        let session = WatchSession {
            id: Uuid::new_v4().to_string(),
            broadcast_id: broadcast_id.to_string(),
            viewer_id: viewer_id.to_string(),
            joined_at: Utc::now(),
            left_at: None,
            accumulated_watch_seconds: 0,
            points_from_watching: 0,
            points_from_messages: 0,
            points_from_reactions: 0,
            points_from_purchase: 0,
            message_count: 0,
            reaction_count: 0,
            purchased: false,
        };
        let handle = WatchSessionHandle {
            session_id: session.id.clone(),
            is_new: true,
        };
        state.sessions.insert(session.id.clone(), session);
        Ok(handle)
    }

    async fn update_watch_time(
        &self,
        session_id: &str,
        viewer_id: &str,
        seconds: u64,
    ) -> Result<WatchTimeUpdate> {
        let mut state = self.enter("update_watch_time")?;
        let rate = state.seconds_per_point;
        let session = Self::session_mut(&mut state, session_id, viewer_id)?;
        if !session.is_open() {
            return Err(Error::rejected("watch session already closed"));
        }
        session.accumulated_watch_seconds += seconds as i64;
        let earned_total = session.accumulated_watch_seconds / rate;
        let points_earned = earned_total - session.points_from_watching;
        session.points_from_watching = earned_total;
        let update = WatchTimeUpdate {
            points_earned,
            total_points: session.total_points(),
            total_watch_seconds: session.accumulated_watch_seconds,
        };
        if points_earned > 0 {
            Self::adjust(
                &mut state,
                viewer_id,
                points_earned,
                TransactionKind::WatchTime,
                "Live broadcast watch time",
                Some(session_id),
            )?;
        }
        Ok(update)
    }

    async fn award_interaction(
        &self,
        session_id: &str,
        viewer_id: &str,
        kind: InteractionKind,
    ) -> Result<InteractionAward> {
        let mut state = self.enter("award_interaction")?;
        let session = Self::session_mut(&mut state, session_id, viewer_id)?;
        let points_earned = match kind {
            InteractionKind::Message => {
                session.message_count += 1;
                session.points_from_messages += MESSAGE_POINTS;
                MESSAGE_POINTS
            }
            InteractionKind::Reaction => {
                session.reaction_count += 1;
                session.points_from_reactions += REACTION_POINTS;
                REACTION_POINTS
            }
            InteractionKind::Purchase if !session.purchased => {
                session.purchased = true;
                session.points_from_purchase += PURCHASE_POINTS;
                PURCHASE_POINTS
            }
            InteractionKind::Purchase => 0,
        };
        if points_earned > 0 {
            Self::adjust(
                &mut state,
                viewer_id,
                points_earned,
                TransactionKind::Interaction,
                kind.as_str(),
                Some(session_id),
            )?;
        }
        Ok(InteractionAward { points_earned })
    }

    async fn close_watch_session(&self, session_id: &str, viewer_id: &str) -> Result<()> {
        let mut state = self.enter("close_watch_session")?;
        let session = Self::session_mut(&mut state, session_id, viewer_id)?;
        if session.left_at.is_none() {
            session.left_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn create_balance_is_idempotent() {
        let store = InMemoryRewardsStore::new();
        let first = store.create_balance("u1").await.unwrap();
        let second = store.create_balance("u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.calls("create_balance"), 2);
    }

    #[tokio::test]
    async fn atomic_adjust_rejects_overdraw() {
        let store = InMemoryRewardsStore::new();
        let err = store
            .atomic_adjust_balance("u1", -5, TransactionKind::Redemption, "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(store.transactions_for("u1").is_empty());
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let store = InMemoryRewardsStore::new();
        store.fail_next("read_balance", InjectedFailure::Transient);
        assert!(store.read_balance("u1").await.unwrap_err().is_transient());
        assert!(store.read_balance("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_only_their_table() {
        let store = InMemoryRewardsStore::new();
        let mut balances = store
            .subscribe_changes("u1", ChangeTable::Balances)
            .await
            .unwrap();
        store
            .atomic_adjust_balance("u1", 10, TransactionKind::Bonus, "b", None)
            .await
            .unwrap();
        let event = balances.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        match event.record {
            crate::sync::ChangeRecord::Balance(row) => assert_eq!(row.points, 10),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn reduced_schema_rejects_total_spent_writes() {
        let store = InMemoryRewardsStore::new().without_total_spent();
        let update = BalanceUpdate {
            points: 1,
            total_earned: 1,
            total_spent: Some(0),
            tier: crate::rewards::Tier::Bronze,
        };
        let err = store.write_balance("u1", &update).await.unwrap_err();
        assert!(err.is_capability_mismatch());
        store
            .write_balance("u1", &update.clone().without_total_spent())
            .await
            .unwrap();
        assert_eq!(store.balance_row("u1").unwrap().total_spent, None);
    }

    #[tokio::test]
    async fn watch_time_credits_whole_points_only() {
        let store = InMemoryRewardsStore::new().with_seconds_per_point(10);
        let handle = store.get_or_create_watch_session("b1", "v1").await.unwrap();
        let first = store
            .update_watch_time(&handle.session_id, "v1", 15)
            .await
            .unwrap();
        assert_eq!(first.points_earned, 1);
        let second = store
            .update_watch_time(&handle.session_id, "v1", 5)
            .await
            .unwrap();
        assert_eq!(second.points_earned, 1);
        assert_eq!(second.total_watch_seconds, 20);
        assert_eq!(store.balance_row("v1").unwrap().points, 2);
    }
}
