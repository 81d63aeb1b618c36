//! Session-scoped registry enforcing one balance subscription per user.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::sync_engine::SyncHandle;
use super::sync_model::SyncStatus;
use crate::rewards::LedgerWriter;
use crate::watch::WatchTimeTracker;

struct RegistryEntry {
    refs: usize,
    handle: Arc<SyncHandle>,
}

/// Reference-counted map of user id → running sync task.
///
/// The first `acquire` for a user starts the task; later ones share it. The
/// task stops when the last lease is released or on `shutdown_user`.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a lease on the user's subscription, calling `start` only when
    /// none is running.
    pub fn acquire<F>(self: &Arc<Self>, user_id: &str, start: F) -> SubscriptionLease
    where
        F: FnOnce() -> SyncHandle,
    {
        let mut entries = self.lock();
        let reusable = entries
            .get(user_id)
            .map(|entry| entry.handle.is_running())
            .unwrap_or(false);
        if !reusable {
            if let Some(stale) = entries.remove(user_id) {
                stale.handle.abort();
            }
        }
        let entry = entries
            .entry(user_id.to_string())
            .and_modify(|entry| {
                entry.refs += 1;
                debug!(
                    "[RewardsSync] Subscription for {} already active ({} refs)",
                    user_id, entry.refs
                );
            })
            .or_insert_with(|| {
                info!("[RewardsSync] Starting subscription for {}", user_id);
                RegistryEntry {
                    refs: 1,
                    handle: Arc::new(start()),
                }
            });
        SubscriptionLease {
            registry: Arc::clone(self),
            user_id: user_id.to_string(),
            handle: Arc::clone(&entry.handle),
            released: false,
        }
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.lock().contains_key(user_id)
    }

    pub fn ref_count(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map(|e| e.refs).unwrap_or(0)
    }

    pub fn active_users(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Drops one reference; returns the handle when it was the last.
    fn release(&self, user_id: &str, handle: &Arc<SyncHandle>) -> Option<Arc<SyncHandle>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(user_id)?;
        if !Arc::ptr_eq(&entry.handle, handle) {
            // Lease outlived a forced shutdown; its task is already gone.
            return None;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entries.remove(user_id).map(|e| e.handle)
        } else {
            None
        }
    }

    /// Stops the user's subscription regardless of outstanding leases.
    pub async fn shutdown_user(&self, user_id: &str) {
        let removed = self.lock().remove(user_id);
        if let Some(entry) = removed {
            info!("[RewardsSync] Tearing down subscription for {}", user_id);
            entry.handle.stop().await;
        }
    }

    /// Stops every subscription; used when the session ends.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, RegistryEntry)> = self.lock().drain().collect();
        for (user_id, entry) in drained {
            debug!("[RewardsSync] Tearing down subscription for {}", user_id);
            entry.handle.stop().await;
        }
    }
}

/// One consumer's claim on a user's subscription.
pub struct SubscriptionLease {
    registry: Arc<SubscriptionRegistry>,
    user_id: String,
    handle: Arc<SyncHandle>,
    released: bool,
}

impl SubscriptionLease {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Ledger shared by every lease on this user.
    pub fn ledger(&self) -> Arc<LedgerWriter> {
        self.handle.ledger()
    }

    /// Watch tracker shared by every lease on this user, if one was attached.
    pub fn watch_tracker(&self) -> Option<WatchTimeTracker> {
        self.handle.watch_tracker()
    }

    pub fn status(&self) -> SyncStatus {
        self.handle.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.handle.watch_status()
    }

    pub fn notify_foreground(&self) {
        self.handle.notify_foreground();
    }

    /// Releases the lease, stopping the task when it was the last one.
    pub async fn release(mut self) {
        self.released = true;
        if let Some(handle) = self.registry.release(&self.user_id, &self.handle) {
            handle.stop().await;
        }
    }
}

impl Drop for SubscriptionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(handle) = self.registry.release(&self.user_id, &self.handle) {
            handle.abort();
        }
    }
}
