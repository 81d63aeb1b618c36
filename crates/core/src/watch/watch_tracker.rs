//! Watch-time accrual for live broadcasts.
//!
//! One viewing per broadcast and viewer. A ticker accumulates elapsed
//! seconds and sends the whole counter once it reaches the flush threshold;
//! the server converts seconds to points and the returned award is credited
//! locally.
//! Seconds leave the counter only after the server acknowledged them, so a
//! failed flush is folded into the next one and a resumed session never
//! resends acknowledged time.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::watch_model::{InteractionKind, WatchPhase, WatchSummary};
use crate::config::WatchSettings;
use crate::errors::Result;
use crate::rewards::{LedgerWriter, TransactionKind};
use crate::store::WatchSessionStoreTrait;

struct ViewingEntry {
    handles: usize,
    viewing: Arc<Viewing>,
}

type ViewingMap = HashMap<String, ViewingEntry>;

fn lock_map(viewings: &Mutex<ViewingMap>) -> MutexGuard<'_, ViewingMap> {
    viewings.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drops one handle; true when it was the last one on a viewing still
/// registered, in which case the caller ends it.
fn release_handle(viewings: &Mutex<ViewingMap>, viewing: &Arc<Viewing>) -> bool {
    let mut map = lock_map(viewings);
    let broadcast_id = &viewing.shared.broadcast_id;
    let Some(entry) = map.get_mut(broadcast_id) else {
        return false;
    };
    if !Arc::ptr_eq(&entry.viewing, viewing) {
        // Handle outlived `end_all`; its viewing is already ended.
        return false;
    }
    entry.handles = entry.handles.saturating_sub(1);
    if entry.handles == 0 {
        map.remove(broadcast_id);
        true
    } else {
        false
    }
}

/// Starts viewings for one viewer.
///
/// At most one viewing runs per broadcast: joining a broadcast that is
/// already being watched hands out another handle on the same ticker. The
/// viewing ends when its last handle is released, or on `end_all`.
#[derive(Clone)]
pub struct WatchTimeTracker {
    store: Arc<dyn WatchSessionStoreTrait>,
    ledger: Arc<LedgerWriter>,
    settings: WatchSettings,
    viewings: Arc<Mutex<ViewingMap>>,
    join_lock: Arc<AsyncMutex<()>>,
}

impl WatchTimeTracker {
    pub fn new(
        store: Arc<dyn WatchSessionStoreTrait>,
        ledger: Arc<LedgerWriter>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            settings,
            viewings: Arc::new(Mutex::new(HashMap::new())),
            join_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn viewer_id(&self) -> &str {
        self.ledger.user_id()
    }

    /// Broadcasts with a running viewing.
    pub fn active_broadcasts(&self) -> Vec<String> {
        lock_map(&self.viewings).keys().cloned().collect()
    }

    /// Resumes the viewer's open session for the broadcast, or creates one,
    /// and starts the ticker. Must be called inside a tokio runtime.
    pub async fn join(&self, broadcast_id: &str) -> Result<ActiveWatch> {
        let _joining = self.join_lock.lock().await;
        if let Some(viewing) = self.share_running(broadcast_id) {
            return Ok(ActiveWatch::new(viewing, Arc::clone(&self.viewings), true));
        }

        let viewer_id = self.viewer_id().to_string();
        let handle = self
            .store
            .get_or_create_watch_session(broadcast_id, &viewer_id)
            .await?;
        info!(
            "[WatchTime] {} session {} for {} on broadcast {}",
            if handle.is_new { "Started" } else { "Resumed" },
            handle.session_id,
            viewer_id,
            broadcast_id
        );

        let shared = Arc::new(WatchShared {
            session_id: handle.session_id.clone(),
            broadcast_id: broadcast_id.to_string(),
            viewer_id,
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            settings: self.settings.clone(),
            counter: AsyncMutex::new(WatchCounter {
                pending_seconds: 0,
                last_tick: Instant::now(),
            }),
            local: Mutex::new(WatchLocal {
                phase: WatchPhase::Init,
                summary: WatchSummary {
                    session_id: handle.session_id,
                    ..WatchSummary::default()
                },
            }),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = tokio::spawn(run_ticker(Arc::clone(&shared), shutdown_rx));
        let viewing = Arc::new(Viewing {
            shared,
            shutdown: shutdown_tx,
            ticker: Mutex::new(Some(ticker)),
        });
        lock_map(&self.viewings).insert(
            broadcast_id.to_string(),
            ViewingEntry {
                handles: 1,
                viewing: Arc::clone(&viewing),
            },
        );
        Ok(ActiveWatch::new(
            viewing,
            Arc::clone(&self.viewings),
            !handle.is_new,
        ))
    }

    fn share_running(&self, broadcast_id: &str) -> Option<Arc<Viewing>> {
        let mut map = lock_map(&self.viewings);
        let entry = map.get_mut(broadcast_id)?;
        if entry.viewing.shared.phase() == WatchPhase::Ended {
            map.remove(broadcast_id);
            return None;
        }
        entry.handles += 1;
        debug!(
            "[WatchTime] Sharing session {} on broadcast {} ({} handles)",
            entry.viewing.shared.session_id, broadcast_id, entry.handles
        );
        Some(Arc::clone(&entry.viewing))
    }

    /// Ends every running viewing: residual flush, then close. Outstanding
    /// handles stay valid but inert.
    pub async fn end_all(&self) -> Vec<WatchSummary> {
        let _joining = self.join_lock.lock().await;
        let drained: Vec<Arc<Viewing>> = lock_map(&self.viewings)
            .drain()
            .map(|(_, entry)| entry.viewing)
            .collect();
        let mut summaries = Vec::with_capacity(drained.len());
        for viewing in drained {
            summaries.push(viewing.end(true).await);
        }
        if !summaries.is_empty() {
            info!(
                "[WatchTime] Ended {} viewing(s) for {}",
                summaries.len(),
                self.viewer_id()
            );
        }
        summaries
    }
}

/// One running viewing: the shared accrual state plus its ticker.
struct Viewing {
    shared: Arc<WatchShared>,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Viewing {
    fn take_ticker(&self) -> Option<JoinHandle<()>> {
        let _ = self.shutdown.send(true);
        self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn stop_ticker(&self) {
        if let Some(ticker) = self.take_ticker() {
            if let Err(err) = ticker.await {
                if !err.is_cancelled() {
                    warn!(
                        "[WatchTime] Ticker for session {} panicked: {}",
                        self.shared.session_id, err
                    );
                }
            }
        }
    }

    async fn end(&self, close: bool) -> WatchSummary {
        self.stop_ticker().await;
        self.shared.finish(close).await
    }
}

struct WatchCounter {
    pending_seconds: u64,
    last_tick: Instant,
}

impl WatchCounter {
    /// Moves whole elapsed seconds into the counter, keeping the fraction.
    fn accumulate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick).as_secs();
        self.pending_seconds += elapsed;
        self.last_tick += std::time::Duration::from_secs(elapsed);
    }
}

struct WatchLocal {
    phase: WatchPhase,
    summary: WatchSummary,
}

struct WatchShared {
    session_id: String,
    broadcast_id: String,
    viewer_id: String,
    store: Arc<dyn WatchSessionStoreTrait>,
    ledger: Arc<LedgerWriter>,
    settings: WatchSettings,
    counter: AsyncMutex<WatchCounter>,
    local: Mutex<WatchLocal>,
}

impl WatchShared {
    fn lock_local(&self) -> MutexGuard<'_, WatchLocal> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn phase(&self) -> WatchPhase {
        self.lock_local().phase
    }

    fn mark_active(&self) {
        let mut local = self.lock_local();
        if local.phase == WatchPhase::Init {
            local.phase = WatchPhase::Active;
        }
    }

    fn summary(&self, pending_seconds: u64) -> WatchSummary {
        let mut summary = self.lock_local().summary.clone();
        summary.pending_seconds = pending_seconds;
        summary
    }

    async fn tick(&self) {
        if self.phase() == WatchPhase::Ended {
            return;
        }
        let mut counter = self.counter.lock().await;
        counter.accumulate(Instant::now());
        if counter.pending_seconds >= self.settings.flush_threshold_secs {
            self.flush(&mut counter).await;
        }
    }

    /// Sends the whole counter. On failure the seconds stay for the next
    /// attempt.
    async fn flush(&self, counter: &mut WatchCounter) {
        let seconds = counter.pending_seconds;
        if seconds == 0 {
            return;
        }
        let base = self.ledger.credit_base();
        match self
            .store
            .update_watch_time(&self.session_id, &self.viewer_id, seconds)
            .await
        {
            Ok(update) => {
                counter.pending_seconds -= seconds;
                {
                    let mut local = self.lock_local();
                    local.summary.flushed_seconds += seconds;
                    local.summary.flush_count += 1;
                    local.summary.points_from_watching += update.points_earned;
                }
                self.ledger
                    .credit_confirmed(update.points_earned, TransactionKind::WatchTime, base);
                debug!(
                    "[WatchTime] Flushed {}s for session {}: +{} points (session total {}s, {} points)",
                    seconds,
                    self.session_id,
                    update.points_earned,
                    update.total_watch_seconds,
                    update.total_points
                );
            }
            Err(err) => {
                warn!(
                    "[WatchTime] Flush of {}s failed for session {}; keeping for next flush: {}",
                    seconds, self.session_id, err
                );
            }
        }
    }

    /// Flushes the residual and, when `close` is set, closes the session.
    /// Idempotent; failures are logged and swallowed.
    async fn finish(&self, close: bool) -> WatchSummary {
        let already_ended = {
            let mut local = self.lock_local();
            let ended = local.phase == WatchPhase::Ended;
            local.phase = WatchPhase::Ended;
            ended
        };
        if already_ended {
            let pending = self.counter.lock().await.pending_seconds;
            return self.summary(pending);
        }

        let mut counter = self.counter.lock().await;
        counter.accumulate(Instant::now());
        self.flush(&mut counter).await;

        if close {
            match self
                .store
                .close_watch_session(&self.session_id, &self.viewer_id)
                .await
            {
                Ok(()) => info!(
                    "[WatchTime] Closed session {} on broadcast {}",
                    self.session_id, self.broadcast_id
                ),
                Err(err) => warn!(
                    "[WatchTime] Failed to close session {}: {}",
                    self.session_id, err
                ),
            }
        } else {
            info!(
                "[WatchTime] Suspended session {} on broadcast {}",
                self.session_id, self.broadcast_id
            );
        }
        self.summary(counter.pending_seconds)
    }

    async fn award(&self, kind: InteractionKind) -> Option<i64> {
        if self.phase() == WatchPhase::Ended {
            debug!(
                "[WatchTime] Ignoring {} after session {} ended",
                kind.as_str(),
                self.session_id
            );
            return None;
        }
        let base = self.ledger.credit_base();
        let mut result = self
            .store
            .award_interaction(&self.session_id, &self.viewer_id, kind)
            .await;
        if matches!(&result, Err(err) if err.is_transient()) {
            debug!(
                "[WatchTime] Retrying {} award for session {}",
                kind.as_str(),
                self.session_id
            );
            result = self
                .store
                .award_interaction(&self.session_id, &self.viewer_id, kind)
                .await;
        }
        match result {
            Ok(award) => {
                {
                    let mut local = self.lock_local();
                    let summary = &mut local.summary;
                    match kind {
                        InteractionKind::Message => {
                            summary.message_count += 1;
                            summary.points_from_messages += award.points_earned;
                        }
                        InteractionKind::Reaction => {
                            summary.reaction_count += 1;
                            summary.points_from_reactions += award.points_earned;
                        }
                        InteractionKind::Purchase => {
                            summary.purchased = true;
                            summary.points_from_purchase += award.points_earned;
                        }
                    }
                }
                self.ledger.credit_confirmed(
                    award.points_earned,
                    TransactionKind::Interaction,
                    base,
                );
                Some(award.points_earned)
            }
            Err(err) => {
                warn!(
                    "[WatchTime] {} award failed for session {}: {}",
                    kind.as_str(),
                    self.session_id,
                    err
                );
                None
            }
        }
    }
}

async fn run_ticker(shared: Arc<WatchShared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared.settings.tick_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    shared.mark_active();
    debug!("[WatchTime] Ticker started for session {}", shared.session_id);
    loop {
        // A flush in flight is never cut short by shutdown.
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        shared.tick().await;
    }
    debug!("[WatchTime] Ticker stopped for session {}", shared.session_id);
}

/// Handle to one ongoing viewing.
///
/// End it with `leave` (or `suspend`). Dropping it releases the handle; when
/// it was the last one the ticker stops and the residual flush and close run
/// in the background. Extra handles from joining the same broadcast again
/// share the viewing, so releasing one of them only returns the summary.
pub struct ActiveWatch {
    viewing: Arc<Viewing>,
    viewings: Arc<Mutex<ViewingMap>>,
    resumed: bool,
    released: bool,
}

impl ActiveWatch {
    fn new(viewing: Arc<Viewing>, viewings: Arc<Mutex<ViewingMap>>, resumed: bool) -> Self {
        Self {
            viewing,
            viewings,
            resumed,
            released: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.viewing.shared.session_id
    }

    pub fn broadcast_id(&self) -> &str {
        &self.viewing.shared.broadcast_id
    }

    /// True when join picked up a session that was already open.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn phase(&self) -> WatchPhase {
        self.viewing.shared.phase()
    }

    /// Local aggregates so far; `pending_seconds` is not included while a
    /// flush holds the counter.
    pub fn summary(&self) -> WatchSummary {
        let pending = self
            .viewing
            .shared
            .counter
            .try_lock()
            .map(|c| c.pending_seconds)
            .unwrap_or(0);
        self.viewing.shared.summary(pending)
    }

    /// Awards an interaction and returns the points granted, or `None` when
    /// the award failed or the viewing has ended.
    pub async fn award_interaction(&self, kind: InteractionKind) -> Option<i64> {
        self.viewing.shared.award(kind).await
    }

    /// Fire-and-forget variant of `award_interaction`.
    pub fn record_interaction(&self, kind: InteractionKind) {
        let shared = Arc::clone(&self.viewing.shared);
        tokio::spawn(async move {
            shared.award(kind).await;
        });
    }

    /// Flushes the residual seconds and closes the session.
    pub async fn leave(mut self) -> WatchSummary {
        self.end(true).await
    }

    /// Flushes the residual seconds but leaves the session open so a later
    /// join resumes it.
    pub async fn suspend(mut self) -> WatchSummary {
        self.end(false).await
    }

    async fn end(&mut self, close: bool) -> WatchSummary {
        self.released = true;
        if release_handle(&self.viewings, &self.viewing) {
            self.viewing.end(close).await
        } else {
            self.summary()
        }
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        if self.released || !release_handle(&self.viewings, &self.viewing) {
            return;
        }
        let ticker = self.viewing.take_ticker();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let viewing = Arc::clone(&self.viewing);
                runtime.spawn(async move {
                    if let Some(ticker) = ticker {
                        let _ = ticker.await;
                    }
                    viewing.shared.finish(true).await;
                });
            }
            Err(_) => {
                if let Some(ticker) = ticker {
                    ticker.abort();
                }
                warn!(
                    "[WatchTime] Session {} dropped outside a runtime; residual time not flushed",
                    self.viewing.shared.session_id
                );
            }
        }
    }
}
