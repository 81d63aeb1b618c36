//! Subscription state machine: Connecting → Connected | Retrying(n) → Polling.
//!
//! Pure transition logic; the engine performs the I/O each action asks for.
//! Polling is terminal for the session, so push and polling can never be
//! active together.

use std::time::Duration;

use super::sync_model::SyncStatus;
use super::sync_scheduler::backoff_with_jitter;
use crate::config::SyncSettings;

/// What the driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Open the push subscription.
    Subscribe,
    /// Consume the open push channel.
    Listen,
    /// Wait, then attempt to subscribe again.
    RetryAfter(Duration),
    /// Abandon push for the rest of the session.
    StartPolling,
    /// Tear everything down.
    Shutdown,
    /// Transition not valid from the current state; keep going.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    status: SyncStatus,
    consecutive_failures: u32,
    settings: SyncSettings,
}

impl SyncStateMachine {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            status: SyncStatus::Connecting,
            consecutive_failures: 0,
            settings,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn on_subscribed(&mut self) -> SyncAction {
        match self.status {
            SyncStatus::Connecting => {
                self.status = SyncStatus::Connected;
                self.consecutive_failures = 0;
                SyncAction::Listen
            }
            _ => SyncAction::Ignore,
        }
    }

    /// A subscribe attempt failed, or an established channel broke.
    pub fn on_failure(&mut self) -> SyncAction {
        match self.status {
            SyncStatus::Connecting | SyncStatus::Connected => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.max_subscribe_attempts.max(1) {
                    self.status = SyncStatus::Polling;
                    SyncAction::StartPolling
                } else {
                    self.status = SyncStatus::Retrying(self.consecutive_failures);
                    SyncAction::RetryAfter(backoff_with_jitter(
                        self.consecutive_failures,
                        self.settings.backoff_base_ms,
                        self.settings.backoff_max_ms,
                    ))
                }
            }
            _ => SyncAction::Ignore,
        }
    }

    pub fn on_retry_elapsed(&mut self) -> SyncAction {
        match self.status {
            SyncStatus::Retrying(_) => {
                self.status = SyncStatus::Connecting;
                SyncAction::Subscribe
            }
            _ => SyncAction::Ignore,
        }
    }

    pub fn on_stop(&mut self) -> SyncAction {
        self.status = SyncStatus::Stopped;
        SyncAction::Shutdown
    }
}
