//! Earn/spend mutations against the remote ledger.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::balance_store::BalanceStore;
use super::rewards_model::{
    Balance, BalanceRow, BalanceUpdate, NewTransaction, Transaction, TransactionKind,
};
use crate::errors::{Error, Result};
use crate::store::RewardsStoreTrait;

/// Applies balance mutations optimistically and commits them remotely.
///
/// The atomic RPC is preferred. When the remote reports it unsupported, the
/// writer switches to the read → write → append composite for the rest of
/// its lifetime. That composite is not guarded against a concurrent writer
/// on another surface; the change feed or the next poll converges state.
pub struct LedgerWriter {
    user_id: String,
    store: Arc<dyn RewardsStoreTrait>,
    balance: Arc<BalanceStore>,
    atomic_available: AtomicBool,
    total_spent_available: AtomicBool,
}

impl LedgerWriter {
    pub fn new(store: Arc<dyn RewardsStoreTrait>, balance: Arc<BalanceStore>) -> Self {
        Self {
            user_id: balance.user_id().to_string(),
            store,
            balance,
            atomic_available: AtomicBool::new(true),
            total_spent_available: AtomicBool::new(true),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn balance_store(&self) -> Arc<BalanceStore> {
        Arc::clone(&self.balance)
    }

    /// Full resync: fetches (or creates) the balance row and replaces local
    /// state with it.
    pub async fn refresh(&self) -> Result<Balance> {
        let row = self.read_or_create().await?;
        let balance = Balance::from_row(row);
        debug!(
            "[Rewards] Refreshed balance for {}: points={} earned={} tier={}",
            self.user_id, balance.points, balance.total_earned, balance.tier
        );
        self.balance.replace(balance.clone());
        Ok(balance)
    }

    pub async fn earn(
        &self,
        amount: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Balance> {
        let fits = self
            .balance
            .balance()
            .map_or(true, |current| current.can_apply(amount));
        if amount <= 0 || !fits {
            return Err(Error::InvalidAmount(amount));
        }
        self.mutate(amount, kind, description, reference_id).await
    }

    /// Fails synchronously, before any remote call, when the local balance
    /// cannot cover `amount`.
    pub async fn spend(
        &self,
        amount: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Balance> {
        if amount <= 0 {
            return Err(Error::InvalidAmount(amount));
        }
        let available = self.balance.available_points();
        if amount > available {
            return Err(Error::InsufficientPoints {
                requested: amount,
                available,
            });
        }
        self.mutate(-amount, kind, description, reference_id).await
    }

    /// Version to pass to `credit_confirmed`; read it before the call that
    /// awards the points.
    pub fn credit_base(&self) -> u64 {
        self.balance.version()
    }

    /// Reflects points the server already credited (watch time, interaction
    /// bonuses). Skipped when an authoritative row landed after `base`, since
    /// it may already include them, or when the balance was cleared. The
    /// next authoritative row supersedes the credited value.
    pub fn credit_confirmed(&self, points: i64, kind: TransactionKind, base: u64) -> bool {
        if points <= 0 {
            return false;
        }
        let credited = self.balance.credit_since(points, base);
        if credited {
            debug!(
                "[Rewards] Credited {} confirmed {} points to {}",
                points,
                kind.as_str(),
                self.user_id
            );
        } else {
            debug!(
                "[Rewards] Skipped {} {} points for {}; balance replaced since award",
                points,
                kind.as_str(),
                self.user_id
            );
        }
        credited
    }

    pub async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.store.list_transactions(&self.user_id, limit).await
    }

    async fn mutate(
        &self,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Balance> {
        let ticket = self.balance.apply_optimistic(delta);
        match self.commit(delta, kind, description, reference_id).await {
            Ok(balance) => {
                self.balance.settle(ticket);
                Ok(balance)
            }
            Err(err) => {
                error!(
                    "[Rewards] {} of {} points for {} failed: {}",
                    kind.as_str(),
                    delta,
                    self.user_id,
                    err
                );
                self.balance.discard(ticket);
                if let Err(sync_err) = self.refresh().await {
                    warn!(
                        "[Rewards] Resync after failed mutation failed for {}: {}",
                        self.user_id, sync_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn commit(
        &self,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Balance> {
        if self.atomic_available.load(Ordering::Acquire) {
            match self
                .store
                .atomic_adjust_balance(&self.user_id, delta, kind, description, reference_id)
                .await
            {
                Ok(row) => {
                    let balance = Balance::from_row(row);
                    self.balance.replace(balance.clone());
                    return Ok(balance);
                }
                Err(err) if err.is_capability_mismatch() => {
                    info!(
                        "[Rewards] Atomic adjust unavailable ({}); using composite writes",
                        err
                    );
                    self.atomic_available.store(false, Ordering::Release);
                }
                Err(err) => return Err(err),
            }
        }
        self.commit_composite(delta, kind, description, reference_id)
            .await
    }

    async fn commit_composite(
        &self,
        delta: i64,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Balance> {
        let mut current = Balance::from_row(self.read_or_create().await?);
        if !current.can_apply(delta) {
            return Err(Error::InvalidAmount(delta));
        }
        if current.points + delta < 0 {
            return Err(Error::rejected(format!(
                "remote balance {} cannot cover {}",
                current.points, -delta
            )));
        }
        current.apply_delta(delta);

        self.write_fields(&current).await?;

        let entry = NewTransaction {
            user_id: self.user_id.clone(),
            delta,
            kind,
            description: description.to_string(),
            reference_id: reference_id.map(str::to_string),
        };
        if let Err(err) = self.store.append_transaction(&entry).await {
            // The balance row is the materialized value; a missing ledger
            // line does not invalidate it.
            warn!(
                "[Rewards] Balance written but ledger append failed for {}: {}",
                self.user_id, err
            );
        }

        self.balance.replace(current.clone());
        Ok(current)
    }

    async fn write_fields(&self, balance: &Balance) -> Result<()> {
        let update = BalanceUpdate::from_balance(balance);
        if !self.total_spent_available.load(Ordering::Acquire) {
            return self
                .store
                .write_balance(&self.user_id, &update.without_total_spent())
                .await;
        }
        match self.store.write_balance(&self.user_id, &update).await {
            Err(err) if err.is_capability_mismatch() => {
                info!(
                    "[Rewards] Remote schema has no lifetime-spent column ({}); writing reduced fields",
                    err
                );
                self.total_spent_available.store(false, Ordering::Release);
                self.store
                    .write_balance(&self.user_id, &update.without_total_spent())
                    .await
            }
            other => other,
        }
    }

    async fn read_or_create(&self) -> Result<BalanceRow> {
        match self.store.read_balance(&self.user_id).await? {
            Some(row) => Ok(row),
            None => self.store.create_balance(&self.user_id).await,
        }
    }
}
