use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use super::*;
use crate::config::SyncSettings;
use crate::rewards::{BalanceRow, BalanceState, BalanceStore, LedgerWriter, Tier, Transaction, TransactionKind};
use crate::store::{ChangeFeedTrait, InMemoryRewardsStore, RewardsStoreTrait};

const USER: &str = "user-1";

fn ledger_for(store: &InMemoryRewardsStore) -> Arc<LedgerWriter> {
    let remote: Arc<dyn RewardsStoreTrait> = Arc::new(store.clone());
    Arc::new(LedgerWriter::new(remote, Arc::new(BalanceStore::new(USER))))
}

fn engine_for(store: &InMemoryRewardsStore, ledger: &Arc<LedgerWriter>) -> BalanceSyncEngine {
    let feed: Arc<dyn ChangeFeedTrait> = Arc::new(store.clone());
    BalanceSyncEngine::new(Arc::clone(ledger), feed, SyncSettings::default())
}

fn row(points: i64, earned: i64, spent: i64, tier: &str) -> BalanceRow {
    BalanceRow {
        user_id: USER.to_string(),
        points,
        total_earned: Some(earned),
        total_spent: Some(spent),
        tier: Some(tier.to_string()),
        updated_at: Some(Utc::now()),
    }
}

async fn wait_status(rx: &mut watch::Receiver<SyncStatus>, want: SyncStatus) {
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == want))
        .await
        .expect("status reached in time")
        .expect("status sender alive");
}

async fn wait_balance<F>(rx: &mut watch::Receiver<BalanceState>, predicate: F)
where
    F: FnMut(&BalanceState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(predicate))
        .await
        .expect("balance reached in time")
        .expect("balance sender alive");
}

#[tokio::test]
async fn pushed_balance_replaces_optimistic_state_exactly() {
    let store = InMemoryRewardsStore::new();
    let ledger = ledger_for(&store);
    let balance = ledger.balance_store();
    balance.replace(crate::rewards::Balance::from_row(row(40, 40, 0, "bronze")));
    let _pending = balance.apply_optimistic(2_000);
    assert_eq!(balance.balance().unwrap().tier, Tier::Silver);

    let subscriber = ChangeFeedSubscriber::new(Arc::clone(&ledger));
    subscriber
        .apply(ChangeEvent::balance(
            ChangeKind::Update,
            row(500, 500, 0, "bronze"),
        ))
        .await
        .unwrap();

    let current = balance.balance().unwrap();
    assert_eq!(current.points, 500);
    assert_eq!(current.total_earned, 500);
    assert_eq!(current.total_spent, 0);
    assert_eq!(current.tier, Tier::Bronze);
}

#[tokio::test]
async fn ledger_insert_triggers_full_refetch() {
    let store = InMemoryRewardsStore::new();
    store.seed_balance(row(75, 75, 0, "bronze"));
    let ledger = ledger_for(&store);
    let subscriber = ChangeFeedSubscriber::new(Arc::clone(&ledger));

    let tx = Transaction {
        id: "tx-1".to_string(),
        user_id: USER.to_string(),
        delta: 75,
        kind: TransactionKind::Purchase,
        description: "order".to_string(),
        reference_id: None,
        created_at: Utc::now(),
    };
    subscriber
        .apply(ChangeEvent::transaction(ChangeKind::Insert, tx))
        .await
        .unwrap();

    assert_eq!(store.calls("read_balance"), 1);
    assert_eq!(ledger.balance_store().available_points(), 75);
}

#[tokio::test]
async fn events_for_other_users_and_deletes_are_ignored() {
    let store = InMemoryRewardsStore::new();
    let ledger = ledger_for(&store);
    let subscriber = ChangeFeedSubscriber::new(Arc::clone(&ledger));
    let mut other = row(9, 9, 0, "bronze");
    other.user_id = "someone-else".to_string();

    subscriber
        .apply(ChangeEvent::balance(ChangeKind::Update, other))
        .await
        .unwrap();
    subscriber
        .apply(ChangeEvent::balance(
            ChangeKind::Delete,
            row(1, 1, 0, "bronze"),
        ))
        .await
        .unwrap();

    assert!(ledger.balance_store().balance().is_none());
    assert_eq!(store.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn connected_engine_reconciles_remote_mutations() {
    let store = InMemoryRewardsStore::new();
    store.seed_balance(row(10, 10, 0, "bronze"));
    let ledger = ledger_for(&store);
    let mut balance_rx = ledger.balance_store().subscribe();
    let handle = engine_for(&store, &ledger).spawn();
    let mut status = handle.watch_status();

    wait_status(&mut status, SyncStatus::Connected).await;
    wait_balance(&mut balance_rx, |s| s.version >= 1).await;
    assert_eq!(store.calls("subscribe_changes"), 2);

    // Another surface writes directly to the backend.
    store
        .atomic_adjust_balance(USER, 990, TransactionKind::Bonus, "bonus", None)
        .await
        .unwrap();
    wait_balance(&mut balance_rx, |s| {
        s.balance.as_ref().map(|b| b.points) == Some(1_000)
    })
    .await;
    let current = ledger.balance_store().balance().unwrap();
    assert_eq!(current.tier, Tier::Silver);
    assert!(current.is_consistent());

    handle.stop().await;
    assert_eq!(handle.status(), SyncStatus::Stopped);
    assert_eq!(store.active_subscriptions(USER), 0);
}

#[tokio::test(start_paused = true)]
async fn three_failed_subscribes_switch_to_polling_for_good() {
    let store = InMemoryRewardsStore::new();
    store.seed_balance(row(5, 5, 0, "bronze"));
    store.set_feed_available(false);
    let ledger = ledger_for(&store);
    let handle = engine_for(&store, &ledger).spawn();
    let mut status = handle.watch_status();

    wait_status(&mut status, SyncStatus::Polling).await;
    assert_eq!(store.calls("subscribe_changes"), 3);

    // The channel recovering does not bring push back this session.
    store.set_feed_available(true);
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(store.calls("subscribe_changes"), 3);
    assert_eq!(handle.status(), SyncStatus::Polling);
    assert_eq!(store.active_subscriptions(USER), 0);

    // Immediate refresh on entering polling plus one per 30s interval.
    assert!(store.calls("read_balance") >= 20);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polling_picks_up_remote_changes_and_foreground_refreshes() {
    let store = InMemoryRewardsStore::new();
    store.seed_balance(row(5, 5, 0, "bronze"));
    store.set_feed_available(false);
    let ledger = ledger_for(&store);
    let handle = engine_for(&store, &ledger).spawn();
    let mut status = handle.watch_status();
    wait_status(&mut status, SyncStatus::Polling).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    store.seed_balance(row(80, 80, 0, "bronze"));
    let reads = store.calls("read_balance");
    handle.notify_foreground();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.calls("read_balance"), reads + 1);
    assert_eq!(ledger.balance_store().available_points(), 80);

    handle.stop().await;
    let reads = store.calls("read_balance");
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(store.calls("read_balance"), reads);
}

#[tokio::test(start_paused = true)]
async fn broken_channel_reconnects_with_backoff() {
    let store = InMemoryRewardsStore::new();
    let ledger = ledger_for(&store);
    let handle = engine_for(&store, &ledger).spawn();
    let mut status = handle.watch_status();
    wait_status(&mut status, SyncStatus::Connected).await;

    store.break_feed(USER);
    wait_status(&mut status, SyncStatus::Retrying(1)).await;
    wait_status(&mut status, SyncStatus::Connected).await;
    assert_eq!(store.calls("subscribe_changes"), 4);
    assert_eq!(store.active_subscriptions(USER), 2);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn registry_shares_one_subscription_per_user() {
    let store = InMemoryRewardsStore::new();
    let ledger = ledger_for(&store);
    let registry = SubscriptionRegistry::new();
    let starts = Arc::new(AtomicUsize::new(0));

    let start = |store: &InMemoryRewardsStore, ledger: &Arc<LedgerWriter>| {
        starts.fetch_add(1, Ordering::SeqCst);
        engine_for(store, ledger).spawn()
    };

    let first = registry.acquire(USER, || start(&store, &ledger));
    let second = registry.acquire(USER, || start(&store, &ledger));
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(registry.ref_count(USER), 2);

    let mut status = first.watch_status();
    wait_status(&mut status, SyncStatus::Connected).await;
    assert_eq!(store.calls("subscribe_changes"), 2);

    first.release().await;
    assert!(registry.is_active(USER));
    assert_eq!(second.status(), SyncStatus::Connected);

    second.release().await;
    assert!(!registry.is_active(USER));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.active_subscriptions(USER), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_lease_tears_down_task() {
    let store = InMemoryRewardsStore::new();
    let ledger = ledger_for(&store);
    let registry = SubscriptionRegistry::new();

    let lease = registry.acquire(USER, || engine_for(&store, &ledger).spawn());
    let mut status = lease.watch_status();
    wait_status(&mut status, SyncStatus::Connected).await;
    drop(lease);

    assert!(!registry.is_active(USER));
    assert_eq!(*status.borrow(), SyncStatus::Stopped);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.active_subscriptions(USER), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_user_ignores_outstanding_leases() {
    let store = InMemoryRewardsStore::new();
    let ledger = ledger_for(&store);
    let registry = SubscriptionRegistry::new();

    let lease = registry.acquire(USER, || engine_for(&store, &ledger).spawn());
    registry.shutdown_user(USER).await;
    assert!(!registry.is_active(USER));
    assert_eq!(lease.status(), SyncStatus::Stopped);

    // Re-initialisation after teardown starts a fresh task.
    let fresh = registry.acquire(USER, || engine_for(&store, &ledger).spawn());
    assert_eq!(registry.ref_count(USER), 1);
    drop(lease);
    assert_eq!(registry.ref_count(USER), 1);
    fresh.release().await;
    registry.shutdown_all().await;
    assert!(registry.active_users().is_empty());
}
