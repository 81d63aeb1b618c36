//! HTTP client for the hosted rewards backend.
//!
//! Tables are read and written through the REST interface, multi-step
//! operations through RPC endpoints, and row changes arrive as server-sent
//! events.

use async_trait::async_trait;
use log::{debug, error};
use pointsync_core::config::RemoteConfig;
use pointsync_core::rewards::{
    BalanceRow, BalanceUpdate, NewTransaction, Tier, Transaction, TransactionKind,
};
use pointsync_core::store::{ChangeFeedTrait, RewardsStoreTrait, WatchSessionStoreTrait};
use pointsync_core::sync::{ChangeStream, ChangeTable};
use pointsync_core::watch::{
    InteractionAward, InteractionKind, WatchSessionHandle, WatchTimeUpdate,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::error::{RemoteError, Result};
use crate::feed::change_stream;
use crate::types::*;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_LOG_BODY_CHARS: usize = 512;

fn truncate_for_log(body: &str) -> String {
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

/// Query values are percent-encoded by reqwest.
fn eq_filter(value: &str) -> String {
    format!("eq.{}", value)
}

/// Client for the rewards REST/RPC/realtime API.
#[derive(Debug, Clone)]
pub struct RewardsApiClient {
    client: reqwest::Client,
    /// No overall timeout: change-feed responses stay open indefinitely.
    stream_client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RewardsApiClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[RewardsApi] Response status: {}", status);
            return;
        }
        debug!(
            "[RewardsApi] Response error ({}): {}",
            status,
            truncate_for_log(body)
        );
    }

    pub fn new(config: &RemoteConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            stream_client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
        }
    }

    /// Builds a client from `POINTSYNC_*` environment variables.
    pub fn from_env() -> pointsync_core::Result<Self> {
        Ok(Self::new(&RemoteConfig::from_env()?))
    }

    /// Replaces the bearer token, e.g. after the session layer refreshed it.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| RemoteError::auth("Invalid API key format"))?;
        headers.insert("apikey", key);

        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RemoteError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        Ok(headers)
    }

    fn headers_with_prefer(&self, prefer: &'static str) -> Result<HeaderMap> {
        let mut headers = self.headers()?;
        headers.insert("prefer", HeaderValue::from_static(prefer));
        Ok(headers)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    fn error_from(status: reqwest::StatusCode, body: &str) -> RemoteError {
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
            let message = match error.details.as_deref().or(error.hint.as_deref()) {
                Some(extra) if !extra.is_empty() => format!("{} ({})", error.message, extra),
                _ => error.message,
            };
            return RemoteError::api(status.as_u16(), error.code, message);
        }
        RemoteError::api(
            status.as_u16(),
            None,
            format!("Request failed: {}", truncate_for_log(body)),
        )
    }

    /// Parse a JSON response body.
    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::error_from(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            error!(
                "[RewardsApi] Failed to deserialize response. Body: {}, Error: {}",
                truncate_for_log(&body),
                e
            );
            RemoteError::Json(e)
        })
    }

    /// Checks the status of a response whose body is not needed.
    async fn expect_success(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Self::log_response(status, "");
            return Ok(());
        }
        let body = response.text().await?;
        Self::log_response(status, &body);
        Err(Self::error_from(status, &body))
    }

    async fn rpc<P: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        function: &str,
        params: &P,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.rpc_url(function))
            .headers(self.headers()?)
            .json(params)
            .send()
            .await?;
        let result: OneOrMany<T> = Self::parse_response(response).await?;
        result.into_first().ok_or_else(|| {
            RemoteError::api(200, None, format!("{} returned no rows", function))
        })
    }

    /// GET /rest/v1/user_points?user_id=eq.{userId}
    pub async fn fetch_balance(&self, user_id: &str) -> Result<Option<BalanceRow>> {
        let response = self
            .client
            .get(self.rest_url(BALANCES_TABLE))
            .headers(self.headers()?)
            .query(&[
                ("user_id", eq_filter(user_id)),
                ("select", "*".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<BalanceRow> = Self::parse_response(response).await?;
        Ok(rows.into_iter().next())
    }

    /// POST /rest/v1/user_points?on_conflict=user_id
    ///
    /// Inserts a zero balance unless one exists. Schemas without the
    /// lifetime-spent column get the reduced row.
    pub async fn insert_balance(&self, user_id: &str) -> Result<BalanceRow> {
        let full = serde_json::json!({
            "user_id": user_id,
            "points": 0,
            "total_earned": 0,
            "total_spent": 0,
            "tier": Tier::Bronze,
        });
        let inserted = match self.insert_balance_row(&full).await {
            Err(err) if err.is_missing_capability() => {
                debug!("[RewardsApi] Balance insert without total_spent: {}", err);
                let reduced = serde_json::json!({
                    "user_id": user_id,
                    "points": 0,
                    "total_earned": 0,
                    "tier": Tier::Bronze,
                });
                self.insert_balance_row(&reduced).await?
            }
            other => other?,
        };
        match inserted {
            Some(row) => Ok(row),
            // Duplicate ignored: another surface created it first.
            None => self.fetch_balance(user_id).await?.ok_or_else(|| {
                RemoteError::api(
                    409,
                    None,
                    format!("balance for {} neither inserted nor readable", user_id),
                )
            }),
        }
    }

    async fn insert_balance_row(&self, body: &serde_json::Value) -> Result<Option<BalanceRow>> {
        let response = self
            .client
            .post(self.rest_url(BALANCES_TABLE))
            .headers(
                self.headers_with_prefer("resolution=ignore-duplicates,return=representation")?,
            )
            .query(&[("on_conflict", "user_id")])
            .json(body)
            .send()
            .await?;
        let rows: Vec<BalanceRow> = Self::parse_response(response).await?;
        Ok(rows.into_iter().next())
    }

    /// POST /rest/v1/rpc/adjust_user_points
    pub async fn adjust_points(
        &self,
        user_id: &str,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<BalanceRow> {
        let params = AdjustPointsParams {
            p_user_id: user_id,
            p_points: delta,
            p_transaction_type: kind,
            p_description: description,
            p_reference_id: reference_id,
        };
        debug!(
            "[RewardsApi] Adjusting {} by {} ({})",
            user_id,
            delta,
            kind.as_str()
        );
        self.rpc(RPC_ADJUST_POINTS, &params).await
    }

    /// PATCH /rest/v1/user_points?user_id=eq.{userId}
    pub async fn update_balance(&self, user_id: &str, update: &BalanceUpdate) -> Result<()> {
        let response = self
            .client
            .patch(self.rest_url(BALANCES_TABLE))
            .headers(self.headers_with_prefer("return=minimal")?)
            .query(&[("user_id", eq_filter(user_id))])
            .json(update)
            .send()
            .await?;
        Self::expect_success(response).await
    }

    /// POST /rest/v1/points_transactions
    pub async fn insert_transaction(&self, entry: &NewTransaction) -> Result<Transaction> {
        let response = self
            .client
            .post(self.rest_url(TRANSACTIONS_TABLE))
            .headers(self.headers_with_prefer("return=representation")?)
            .json(&NewTransactionRow::from(entry))
            .send()
            .await?;
        let rows: Vec<TransactionRow> = Self::parse_response(response).await?;
        rows.into_iter()
            .next()
            .map(Transaction::from)
            .ok_or_else(|| RemoteError::api(200, None, "transaction insert returned no rows"))
    }

    /// GET /rest/v1/points_transactions?user_id=eq.{userId}&order=created_at.desc
    pub async fn fetch_transactions(&self, user_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        let response = self
            .client
            .get(self.rest_url(TRANSACTIONS_TABLE))
            .headers(self.headers()?)
            .query(&[
                ("user_id", eq_filter(user_id)),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<TransactionRow> = Self::parse_response(response).await?;
        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    /// GET /realtime/v1/changes?table={table}&filter=user_id=eq.{userId}
    pub async fn open_changes(&self, user_id: &str, table: ChangeTable) -> Result<ChangeStream> {
        let mut headers = self.headers()?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let response = self
            .stream_client
            .get(format!("{}/realtime/v1/changes", self.base_url))
            .headers(headers)
            .query(&[
                ("table", table.table_name().to_string()),
                ("filter", format!("user_id={}", eq_filter(user_id))),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            Self::log_response(status, &body);
            return Err(Self::error_from(status, &body));
        }
        debug!(
            "[RewardsApi] Change feed open for {} on {}",
            user_id,
            table.table_name()
        );
        Ok(change_stream(response.bytes_stream()))
    }

    /// POST /rest/v1/rpc/get_or_create_watch_session
    pub async fn start_watch_session(
        &self,
        broadcast_id: &str,
        viewer_id: &str,
    ) -> Result<WatchSessionResponse> {
        let params = WatchSessionParams {
            p_broadcast_id: broadcast_id,
            p_viewer_id: viewer_id,
        };
        self.rpc(RPC_GET_OR_CREATE_WATCH_SESSION, &params).await
    }

    /// POST /rest/v1/rpc/update_watch_time
    pub async fn report_watch_time(
        &self,
        session_id: &str,
        viewer_id: &str,
        seconds: u64,
    ) -> Result<WatchTimeResponse> {
        let params = WatchTimeParams {
            p_session_id: session_id,
            p_viewer_id: viewer_id,
            p_seconds: seconds,
        };
        self.rpc(RPC_UPDATE_WATCH_TIME, &params).await
    }

    /// POST /rest/v1/rpc/award_interaction_points
    pub async fn report_interaction(
        &self,
        session_id: &str,
        viewer_id: &str,
        kind: InteractionKind,
    ) -> Result<InteractionResponse> {
        let params = InteractionParams {
            p_session_id: session_id,
            p_viewer_id: viewer_id,
            p_interaction_type: kind,
        };
        self.rpc(RPC_AWARD_INTERACTION, &params).await
    }

    /// POST /rest/v1/rpc/close_watch_session
    pub async fn end_watch_session(&self, session_id: &str, viewer_id: &str) -> Result<()> {
        let params = CloseSessionParams {
            p_session_id: session_id,
            p_viewer_id: viewer_id,
        };
        let response = self
            .client
            .post(self.rpc_url(RPC_CLOSE_WATCH_SESSION))
            .headers(self.headers()?)
            .json(&params)
            .send()
            .await?;
        Self::expect_success(response).await
    }
}

#[async_trait]
impl RewardsStoreTrait for RewardsApiClient {
    async fn read_balance(&self, user_id: &str) -> pointsync_core::Result<Option<BalanceRow>> {
        Ok(self.fetch_balance(user_id).await?)
    }

    async fn create_balance(&self, user_id: &str) -> pointsync_core::Result<BalanceRow> {
        Ok(self.insert_balance(user_id).await?)
    }

    async fn atomic_adjust_balance(
        &self,
        user_id: &str,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> pointsync_core::Result<BalanceRow> {
        Ok(self
            .adjust_points(user_id, delta, kind, description, reference_id)
            .await?)
    }

    async fn write_balance(
        &self,
        user_id: &str,
        update: &BalanceUpdate,
    ) -> pointsync_core::Result<()> {
        Ok(self.update_balance(user_id, update).await?)
    }

    async fn append_transaction(
        &self,
        entry: &NewTransaction,
    ) -> pointsync_core::Result<Transaction> {
        Ok(self.insert_transaction(entry).await?)
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> pointsync_core::Result<Vec<Transaction>> {
        Ok(self.fetch_transactions(user_id, limit).await?)
    }
}

#[async_trait]
impl ChangeFeedTrait for RewardsApiClient {
    async fn subscribe_changes(
        &self,
        user_id: &str,
        table: ChangeTable,
    ) -> pointsync_core::Result<ChangeStream> {
        self.open_changes(user_id, table)
            .await
            .map_err(|err| match pointsync_core::Error::from(err) {
                // Any failure to open the channel counts against the
                // subscribe budget rather than failing the caller.
                pointsync_core::Error::Transient(msg) | pointsync_core::Error::Rejected(msg) => {
                    pointsync_core::Error::Subscription(msg)
                }
                other => other,
            })
    }
}

#[async_trait]
impl WatchSessionStoreTrait for RewardsApiClient {
    async fn get_or_create_watch_session(
        &self,
        broadcast_id: &str,
        viewer_id: &str,
    ) -> pointsync_core::Result<WatchSessionHandle> {
        Ok(self
            .start_watch_session(broadcast_id, viewer_id)
            .await?
            .into())
    }

    async fn update_watch_time(
        &self,
        session_id: &str,
        viewer_id: &str,
        seconds: u64,
    ) -> pointsync_core::Result<WatchTimeUpdate> {
        Ok(self
            .report_watch_time(session_id, viewer_id, seconds)
            .await?
            .into())
    }

    async fn award_interaction(
        &self,
        session_id: &str,
        viewer_id: &str,
        kind: InteractionKind,
    ) -> pointsync_core::Result<InteractionAward> {
        Ok(self
            .report_interaction(session_id, viewer_id, kind)
            .await?
            .into())
    }

    async fn close_watch_session(
        &self,
        session_id: &str,
        viewer_id: &str,
    ) -> pointsync_core::Result<()> {
        Ok(self.end_watch_session(session_id, viewer_id).await?)
    }
}
