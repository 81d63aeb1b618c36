//! Background driver for one user's balance sync.
//!
//! A single task walks the subscription state machine: it holds the push
//! channel while connected, backs off between failed attempts, and polls once
//! the push channel is abandoned. Push and polling therefore never overlap.

use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::change_feed::ChangeFeedSubscriber;
use super::sync_model::{ChangeStream, SyncStatus};
use super::sync_state::{SyncAction, SyncStateMachine};
use crate::config::SyncSettings;
use crate::rewards::LedgerWriter;
use crate::store::ChangeFeedTrait;
use crate::watch::WatchTimeTracker;

/// Spawns the sync task for one user.
pub struct BalanceSyncEngine {
    ledger: Arc<LedgerWriter>,
    feed: Arc<dyn ChangeFeedTrait>,
    settings: SyncSettings,
}

impl BalanceSyncEngine {
    pub fn new(
        ledger: Arc<LedgerWriter>,
        feed: Arc<dyn ChangeFeedTrait>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            ledger,
            feed,
            settings,
        }
    }

    /// Starts the task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> SyncHandle {
        let user_id = self.ledger.user_id().to_string();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let foreground = Arc::new(Notify::new());

        let ledger = Arc::clone(&self.ledger);
        let runner = SyncRunner {
            subscriber: ChangeFeedSubscriber::new(Arc::clone(&self.ledger)),
            ledger: self.ledger,
            feed: self.feed,
            settings: self.settings.clone(),
            machine: SyncStateMachine::new(self.settings),
            status: Arc::clone(&status_tx),
            foreground: Arc::clone(&foreground),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(runner.run());

        SyncHandle {
            user_id,
            ledger,
            status_tx,
            status_rx,
            foreground,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            watch_tracker: None,
        }
    }
}

/// Control handle for a running sync task. Dropping it aborts the task.
pub struct SyncHandle {
    user_id: String,
    ledger: Arc<LedgerWriter>,
    status_tx: Arc<watch::Sender<SyncStatus>>,
    status_rx: watch::Receiver<SyncStatus>,
    foreground: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    watch_tracker: Option<WatchTimeTracker>,
}

impl SyncHandle {
    /// Attaches the user's watch tracker so its viewings end with the task.
    pub fn with_watch_tracker(mut self, tracker: WatchTimeTracker) -> Self {
        self.watch_tracker = Some(tracker);
        self
    }

    pub fn watch_tracker(&self) -> Option<WatchTimeTracker> {
        self.watch_tracker.clone()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The ledger whose balance store this task keeps in sync.
    pub fn ledger(&self) -> Arc<LedgerWriter> {
        Arc::clone(&self.ledger)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// The app returned to the foreground; refreshes at once while polling.
    pub fn notify_foreground(&self) {
        self.foreground.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Signals shutdown and waits for the task to exit, then ends any
    /// viewing of the attached watch tracker.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.lock_task().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("[RewardsSync] Sync task for {} panicked: {}", self.user_id, err);
                }
            }
        }
        self.status_tx.send_replace(SyncStatus::Stopped);
        if let Some(tracker) = &self.watch_tracker {
            tracker.end_all().await;
        }
    }

    /// Stops the task without waiting for it.
    pub fn abort(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
        self.status_tx.send_replace(SyncStatus::Stopped);
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

struct SyncRunner {
    subscriber: ChangeFeedSubscriber,
    ledger: Arc<LedgerWriter>,
    feed: Arc<dyn ChangeFeedTrait>,
    settings: SyncSettings,
    machine: SyncStateMachine,
    status: Arc<watch::Sender<SyncStatus>>,
    foreground: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl SyncRunner {
    async fn run(mut self) {
        let user_id = self.ledger.user_id().to_string();
        debug!("[RewardsSync] Sync task started for {}", user_id);
        let mut action = SyncAction::Subscribe;
        let mut channel: Option<ChangeStream> = None;

        loop {
            self.publish();
            let next = match action {
                SyncAction::Subscribe => self.subscribe(&mut channel).await,
                SyncAction::Listen => match channel.take() {
                    Some(stream) => self.listen(stream).await,
                    None => Some(self.machine.on_failure()),
                },
                SyncAction::RetryAfter(delay) => self.wait_retry(delay).await,
                SyncAction::StartPolling => {
                    info!(
                        "[RewardsSync] Push channel unavailable after {} attempts; polling every {}s for {}",
                        self.machine.consecutive_failures(),
                        self.settings.poll_interval().as_secs(),
                        user_id
                    );
                    self.poll().await
                }
                SyncAction::Shutdown | SyncAction::Ignore => None,
            };
            match next {
                Some(next) => action = next,
                None => break,
            }
        }

        self.machine.on_stop();
        self.publish();
        debug!("[RewardsSync] Sync task stopped for {}", user_id);
    }

    fn publish(&self) {
        self.status.send_if_modified(|current| {
            let next = self.machine.status();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Returns `None` when shutdown was requested.
    async fn subscribe(&mut self, channel: &mut Option<ChangeStream>) -> Option<SyncAction> {
        if self.is_shutdown() {
            return None;
        }
        let feed = Arc::clone(&self.feed);
        let opened = tokio::select! {
            _ = self.shutdown.changed() => return None,
            opened = self.subscriber.open(feed.as_ref()) => opened,
        };
        match opened {
            Ok(stream) => {
                let action = self.machine.on_subscribed();
                info!(
                    "[RewardsSync] Push channel connected for {}",
                    self.subscriber.user_id()
                );
                self.publish();
                // Catch up on anything committed before the channel opened.
                if let Err(err) = self.ledger.refresh().await {
                    warn!(
                        "[RewardsSync] Initial refresh failed for {}: {}",
                        self.subscriber.user_id(),
                        err
                    );
                }
                *channel = Some(stream);
                Some(action)
            }
            Err(err) => {
                warn!(
                    "[RewardsSync] Subscribe attempt {} failed for {}: {}",
                    self.machine.consecutive_failures() + 1,
                    self.subscriber.user_id(),
                    err
                );
                Some(self.machine.on_failure())
            }
        }
    }

    async fn listen(&mut self, mut stream: ChangeStream) -> Option<SyncAction> {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.changed() => return None,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    if let Err(err) = self.subscriber.apply(event).await {
                        warn!(
                            "[RewardsSync] Failed to apply change for {}: {}",
                            self.subscriber.user_id(),
                            err
                        );
                    }
                }
                Some(Err(err)) => {
                    warn!(
                        "[RewardsSync] Push channel error for {}: {}",
                        self.subscriber.user_id(),
                        err
                    );
                    return Some(self.machine.on_failure());
                }
                None => {
                    warn!(
                        "[RewardsSync] Push channel closed for {}",
                        self.subscriber.user_id()
                    );
                    return Some(self.machine.on_failure());
                }
            }
        }
    }

    async fn wait_retry(&mut self, delay: Duration) -> Option<SyncAction> {
        debug!(
            "[RewardsSync] Retrying subscription for {} in {}ms",
            self.subscriber.user_id(),
            delay.as_millis()
        );
        tokio::select! {
            _ = self.shutdown.changed() => None,
            _ = tokio::time::sleep(delay) => Some(self.machine.on_retry_elapsed()),
        }
    }

    /// Runs until shutdown; polling is terminal for the session.
    async fn poll(&mut self) -> Option<SyncAction> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let foreground = Arc::clone(&self.foreground);
        loop {
            let trigger = tokio::select! {
                _ = self.shutdown.changed() => return None,
                _ = ticker.tick() => "interval",
                _ = foreground.notified() => "foreground",
            };
            match self.ledger.refresh().await {
                Ok(balance) => debug!(
                    "[RewardsSync] Poll ({}) for {}: points={}",
                    trigger, balance.user_id, balance.points
                ),
                Err(err) => warn!(
                    "[RewardsSync] Poll ({}) failed for {}: {}",
                    trigger,
                    self.subscriber.user_id(),
                    err
                ),
            }
        }
    }
}
