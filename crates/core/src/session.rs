//! Consumer-facing adapters over the ledger and sync layers.
//!
//! `RewardsSession` is the shared handle a signed-in surface holds: every
//! session for the same user shares one ledger, one balance store and one
//! subscription. `BalanceAccessor` is the standalone read path for screens
//! that only display a balance.

use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::RewardsSettings;
use crate::errors::Result;
use crate::rewards::{
    tier_progress, Balance, BalanceState, BalanceStore, LedgerWriter, TierProgress, Transaction,
    TransactionKind,
};
use crate::store::{ChangeFeedTrait, RewardsStoreTrait, WatchSessionStoreTrait};
use crate::sync::{BalanceSyncEngine, SubscriptionLease, SubscriptionRegistry, SyncStatus};
use crate::watch::{ActiveWatch, WatchTimeTracker};

/// The three remote seams a session talks to.
#[derive(Clone)]
pub struct RewardsStores {
    pub rewards: Arc<dyn RewardsStoreTrait>,
    pub feed: Arc<dyn ChangeFeedTrait>,
    pub watch: Arc<dyn WatchSessionStoreTrait>,
}

impl RewardsStores {
    /// Uses one implementation for every seam.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: RewardsStoreTrait + ChangeFeedTrait + WatchSessionStoreTrait + 'static,
    {
        Self {
            rewards: store.clone(),
            feed: store.clone(),
            watch: store,
        }
    }
}

/// A surface's claim on one user's rewards state.
pub struct RewardsSession {
    ledger: Arc<LedgerWriter>,
    tracker: WatchTimeTracker,
    registry: Arc<SubscriptionRegistry>,
    lease: SubscriptionLease,
}

impl RewardsSession {
    /// Joins (or starts) the user's subscription and loads the balance.
    ///
    /// A failed initial load is logged; the sync task catches up.
    pub async fn start(
        user_id: &str,
        stores: RewardsStores,
        settings: RewardsSettings,
        registry: &Arc<SubscriptionRegistry>,
    ) -> Self {
        let lease = registry.acquire(user_id, || {
            let ledger = Arc::new(LedgerWriter::new(
                Arc::clone(&stores.rewards),
                Arc::new(BalanceStore::new(user_id)),
            ));
            let tracker = WatchTimeTracker::new(
                Arc::clone(&stores.watch),
                Arc::clone(&ledger),
                settings.watch.clone(),
            );
            BalanceSyncEngine::new(ledger, Arc::clone(&stores.feed), settings.sync.clone())
                .spawn()
                .with_watch_tracker(tracker)
        });
        let ledger = lease.ledger();
        if ledger.balance_store().balance().is_none() {
            if let Err(err) = ledger.refresh().await {
                warn!(
                    "[Rewards] Initial balance load failed for {}: {}",
                    user_id, err
                );
            }
        }
        let tracker = lease.watch_tracker().unwrap_or_else(|| {
            WatchTimeTracker::new(Arc::clone(&stores.watch), Arc::clone(&ledger), settings.watch)
        });
        Self {
            ledger,
            tracker,
            registry: Arc::clone(registry),
            lease,
        }
    }

    pub fn user_id(&self) -> &str {
        self.ledger.user_id()
    }

    pub fn balance(&self) -> Option<Balance> {
        self.ledger.balance_store().balance()
    }

    pub fn available_points(&self) -> i64 {
        self.ledger.balance_store().available_points()
    }

    /// Observes every balance change, optimistic or authoritative.
    pub fn watch_balance(&self) -> watch::Receiver<BalanceState> {
        self.ledger.balance_store().subscribe()
    }

    pub fn tier_progress(&self) -> Option<TierProgress> {
        self.balance().map(|b| tier_progress(b.total_earned))
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.lease.status()
    }

    pub fn watch_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.lease.watch_status()
    }

    /// Call when the app returns to the foreground.
    pub fn notify_foreground(&self) {
        self.lease.notify_foreground();
    }

    pub async fn earn(
        &self,
        amount: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Balance> {
        self.ledger
            .earn(amount, kind, description, reference_id)
            .await
    }

    pub async fn spend(
        &self,
        amount: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Balance> {
        self.ledger
            .spend(amount, kind, description, reference_id)
            .await
    }

    pub async fn refresh(&self) -> Result<Balance> {
        self.ledger.refresh().await
    }

    pub async fn transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.ledger.recent_transactions(limit).await
    }

    pub fn watch_tracker(&self) -> WatchTimeTracker {
        self.tracker.clone()
    }

    pub async fn join_broadcast(&self, broadcast_id: &str) -> Result<ActiveWatch> {
        self.tracker.join(broadcast_id).await
    }

    /// Gives up this surface's claim; the subscription and any running
    /// viewing stop with the last.
    pub async fn close(self) {
        self.lease.release().await;
    }

    /// Ends every viewing, tears down the user's subscription regardless of
    /// other surfaces and forgets the local balance.
    pub async fn sign_out(self) {
        let user_id = self.user_id().to_string();
        self.tracker.end_all().await;
        self.registry.shutdown_user(&user_id).await;
        self.ledger.balance_store().clear();
        info!("[Rewards] Signed out {}", user_id);
    }
}

/// One-shot balance reads without a subscription.
#[derive(Clone)]
pub struct BalanceAccessor {
    store: Arc<dyn RewardsStoreTrait>,
}

impl BalanceAccessor {
    pub fn new(store: Arc<dyn RewardsStoreTrait>) -> Self {
        Self { store }
    }

    /// Fetches the user's balance, creating the row on first access.
    pub async fn fetch(&self, user_id: &str) -> Result<Balance> {
        let ledger = LedgerWriter::new(
            Arc::clone(&self.store),
            Arc::new(BalanceStore::new(user_id)),
        );
        ledger.refresh().await
    }

    pub async fn tier_progress(&self, user_id: &str) -> Result<TierProgress> {
        let balance = self.fetch(user_id).await?;
        Ok(tier_progress(balance.total_earned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewards::{BalanceRow, Tier};
    use crate::store::InMemoryRewardsStore;
    use crate::watch::{InteractionKind, WatchPhase};
    use std::time::Duration;

    const USER: &str = "user-1";

    fn stores(store: &InMemoryRewardsStore) -> RewardsStores {
        RewardsStores::from_shared(Arc::new(store.clone()))
    }

    async fn wait_connected(session: &RewardsSession) {
        let mut status = session.watch_sync_status();
        tokio::time::timeout(
            Duration::from_secs(60),
            status.wait_for(|s| *s == SyncStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_for_one_user_share_state_and_subscription() {
        let store = InMemoryRewardsStore::new();
        let registry = SubscriptionRegistry::new();
        let header =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;
        let profile =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;
        wait_connected(&header).await;

        assert_eq!(registry.ref_count(USER), 2);
        assert_eq!(store.calls("subscribe_changes"), 2);

        header
            .earn(1_000, TransactionKind::Purchase, "order", Some("o-1"))
            .await
            .unwrap();
        assert_eq!(profile.available_points(), 1_000);
        assert_eq!(profile.balance().unwrap().tier, Tier::Silver);

        let progress = profile.tier_progress().unwrap();
        assert_eq!(progress.next_tier, Some(Tier::Gold));
        assert_eq!(progress.points_to_next, 4_000);

        header.close().await;
        assert!(registry.is_active(USER));
        profile.close().await;
        assert!(!registry.is_active(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_tears_down_everything() {
        let store = InMemoryRewardsStore::new();
        let registry = SubscriptionRegistry::new();
        let first =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;
        let second =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;
        wait_connected(&first).await;
        let balance_rx = first.watch_balance();

        first.sign_out().await;
        assert!(!registry.is_active(USER));
        assert_eq!(second.sync_status(), SyncStatus::Stopped);
        assert!(balance_rx.borrow().balance.is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.active_subscriptions(USER), 0);
        second.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn session_watch_credits_shared_balance() {
        let store = InMemoryRewardsStore::new();
        let registry = SubscriptionRegistry::new();
        let session =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;

        let watch = session.join_broadcast("broadcast-7").await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        let summary = watch.leave().await;

        assert_eq!(summary.flushed_seconds, 60);
        assert_eq!(session.available_points(), 6);
        let history = session.transactions(10).await.unwrap();
        assert!(history
            .iter()
            .all(|tx| tx.kind == TransactionKind::WatchTime));
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_ends_running_viewings() {
        let store = InMemoryRewardsStore::new();
        let registry = SubscriptionRegistry::new();
        let session =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;
        let balance_rx = session.watch_balance();

        let watch = session.join_broadcast("broadcast-3").await.unwrap();
        let session_id = watch.session_id().to_string();
        tokio::time::sleep(Duration::from_secs(45)).await;

        session.sign_out().await;
        assert_eq!(watch.phase(), WatchPhase::Ended);
        let viewing = store.session(&session_id).unwrap();
        assert_eq!(viewing.accumulated_watch_seconds, 45);
        assert!(!viewing.is_open());
        assert!(balance_rx.borrow().balance.is_none());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.calls("update_watch_time"), 2);
        assert!(balance_rx.borrow().balance.is_none());
        assert!(watch.award_interaction(InteractionKind::Message).await.is_none());
        drop(watch);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.calls("close_watch_session"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_share_one_viewing_per_broadcast() {
        let store = InMemoryRewardsStore::new();
        let registry = SubscriptionRegistry::new();
        let header =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;
        let player =
            RewardsSession::start(USER, stores(&store), RewardsSettings::default(), &registry)
                .await;

        let first = header.join_broadcast("broadcast-4").await.unwrap();
        let second = player.join_broadcast("broadcast-4").await.unwrap();
        assert_eq!(first.session_id(), second.session_id());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(
            store.session(first.session_id()).unwrap().accumulated_watch_seconds,
            30
        );

        second.leave().await;
        let summary = first.leave().await;
        assert_eq!(summary.flushed_seconds, 31);
        assert_eq!(header.available_points(), 3);

        header.close().await;
        player.close().await;
    }

    #[tokio::test]
    async fn accessor_reads_balance_with_tier() {
        let store = InMemoryRewardsStore::new();
        store.seed_balance(BalanceRow {
            user_id: USER.to_string(),
            points: 4_200,
            total_earned: Some(6_000),
            total_spent: Some(1_800),
            tier: None,
            updated_at: None,
        });
        let accessor = BalanceAccessor::new(Arc::new(store.clone()));

        let balance = accessor.fetch(USER).await.unwrap();
        assert_eq!(balance.points, 4_200);
        assert_eq!(balance.tier, Tier::Gold);

        let progress = accessor.tier_progress(USER).await.unwrap();
        assert_eq!(progress.tier, Tier::Gold);
        assert_eq!(progress.points_to_next, 9_000);

        let fresh = accessor.fetch("newcomer").await.unwrap();
        assert_eq!(fresh.points, 0);
        assert_eq!(fresh.tier, Tier::Bronze);
        assert_eq!(store.calls("create_balance"), 1);
    }
}
