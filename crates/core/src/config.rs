//! Configuration for the remote endpoint and the sync/watch schedulers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::sync::{
    REWARDS_SYNC_BACKOFF_BASE_MS, REWARDS_SYNC_BACKOFF_MAX_MS, REWARDS_SYNC_MAX_SUBSCRIBE_ATTEMPTS,
    REWARDS_SYNC_POLL_INTERVAL_SECS,
};
use crate::watch::{WATCH_FLUSH_THRESHOLD_SECS, WATCH_TICK_INTERVAL_SECS};

pub const ENV_API_URL: &str = "POINTSYNC_API_URL";
pub const ENV_API_KEY: &str = "POINTSYNC_API_KEY";
pub const ENV_ACCESS_TOKEN: &str = "POINTSYNC_ACCESS_TOKEN";

/// Endpoint + credential pair for the remote rewards store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Bearer token of the signed-in user, when the session layer provides one.
    #[serde(default)]
    pub access_token: Option<String>,
}

impl RemoteConfig {
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(Error::Config("endpoint must not be empty".to_string()));
        }
        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(Error::Config("api key must not be empty".to_string()));
        }
        Ok(Self {
            endpoint,
            api_key,
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Reads `POINTSYNC_API_URL`, `POINTSYNC_API_KEY` and the optional
    /// `POINTSYNC_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let endpoint = read_env(ENV_API_URL).ok_or_else(|| {
            Error::Config(format!(
                "{} not configured. Rewards sync is disabled.",
                ENV_API_URL
            ))
        })?;
        let api_key = read_env(ENV_API_KEY)
            .ok_or_else(|| Error::Config(format!("{} not configured.", ENV_API_KEY)))?;
        let config = Self::new(&endpoint, &api_key)?;
        Ok(match read_env(ENV_ACCESS_TOKEN) {
            Some(token) => config.with_access_token(token),
            None => config,
        })
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Push-subscription retry and polling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Consecutive failed subscribe attempts before switching to polling.
    pub max_subscribe_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub poll_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_subscribe_attempts: REWARDS_SYNC_MAX_SUBSCRIBE_ATTEMPTS,
            backoff_base_ms: REWARDS_SYNC_BACKOFF_BASE_MS,
            backoff_max_ms: REWARDS_SYNC_BACKOFF_MAX_MS,
            poll_interval_secs: REWARDS_SYNC_POLL_INTERVAL_SECS,
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Watch-time ticker and flush batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchSettings {
    pub tick_interval_secs: u64,
    pub flush_threshold_secs: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: WATCH_TICK_INTERVAL_SECS,
            flush_threshold_secs: WATCH_FLUSH_THRESHOLD_SECS,
        }
    }
}

impl WatchSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Everything a rewards session needs besides the stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RewardsSettings {
    pub sync: SyncSettings,
    pub watch: WatchSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_config_trims_endpoint() {
        let config = RemoteConfig::new(" https://rewards.example.com/ ", "anon").unwrap();
        assert_eq!(config.endpoint, "https://rewards.example.com");
        assert!(config.access_token.is_none());
    }

    #[test]
    fn remote_config_rejects_blank_values() {
        assert!(matches!(
            RemoteConfig::new("  ", "key"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RemoteConfig::new("https://x", ""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn settings_fill_missing_fields_from_defaults() {
        let settings: SyncSettings = serde_json::from_str(r#"{"pollIntervalSecs": 10}"#).unwrap();
        assert_eq!(settings.poll_interval_secs, 10);
        assert_eq!(
            settings.max_subscribe_attempts,
            REWARDS_SYNC_MAX_SUBSCRIBE_ATTEMPTS
        );

        let watch = WatchSettings::default();
        assert_eq!(watch.tick_interval(), Duration::from_secs(10));
        assert_eq!(watch.flush_threshold_secs, 30);
    }

    #[test]
    fn rewards_settings_nest_both_sections() {
        let settings: RewardsSettings =
            serde_json::from_str(r#"{"watch": {"flushThresholdSecs": 60}}"#).unwrap();
        assert_eq!(settings.watch.flush_threshold_secs, 60);
        assert_eq!(settings.watch.tick_interval_secs, 10);
        assert_eq!(settings.sync, SyncSettings::default());
    }
}
