//! Reconciles pushed row changes into the balance store.

use futures::stream;
use log::{debug, warn};
use std::sync::Arc;

use super::sync_model::{ChangeEvent, ChangeKind, ChangeRecord, ChangeStream, ChangeTable};
use crate::errors::Result;
use crate::rewards::{Balance, LedgerWriter};
use crate::store::ChangeFeedTrait;

/// Applies change events for one user.
///
/// Balance rows replace local state wholesale, superseding any optimistic
/// delta. A new ledger row triggers a full refetch instead of an incremental
/// merge, so a transaction is never counted on top of a balance that already
/// includes it.
#[derive(Clone)]
pub struct ChangeFeedSubscriber {
    ledger: Arc<LedgerWriter>,
}

impl ChangeFeedSubscriber {
    pub fn new(ledger: Arc<LedgerWriter>) -> Self {
        Self { ledger }
    }

    pub fn user_id(&self) -> &str {
        self.ledger.user_id()
    }

    /// Opens balance and ledger subscriptions as one logical stream.
    pub async fn open(&self, feed: &dyn ChangeFeedTrait) -> Result<ChangeStream> {
        let balances = feed
            .subscribe_changes(self.user_id(), ChangeTable::Balances)
            .await?;
        let transactions = feed
            .subscribe_changes(self.user_id(), ChangeTable::Transactions)
            .await?;
        Ok(Box::pin(stream::select(balances, transactions)))
    }

    pub async fn apply(&self, event: ChangeEvent) -> Result<()> {
        match (event.kind, event.record) {
            (ChangeKind::Delete, ChangeRecord::Balance(row)) => {
                warn!(
                    "[RewardsSync] Balance row for {} deleted remotely; keeping local state",
                    row.user_id
                );
                Ok(())
            }
            (_, ChangeRecord::Balance(row)) => {
                if row.user_id != self.user_id() {
                    debug!(
                        "[RewardsSync] Ignoring balance event for other user {}",
                        row.user_id
                    );
                    return Ok(());
                }
                let balance = Balance::from_row(row);
                debug!(
                    "[RewardsSync] Pushed balance for {}: points={} tier={}",
                    balance.user_id, balance.points, balance.tier
                );
                self.ledger.balance_store().replace(balance);
                Ok(())
            }
            (ChangeKind::Insert, ChangeRecord::Transaction(tx)) => {
                debug!(
                    "[RewardsSync] Ledger insert {} ({} {}); refetching balance",
                    tx.id,
                    tx.kind.as_str(),
                    tx.delta
                );
                self.ledger.refresh().await.map(|_| ())
            }
            (kind, ChangeRecord::Transaction(tx)) => {
                warn!(
                    "[RewardsSync] Unexpected {:?} on immutable ledger row {}",
                    kind, tx.id
                );
                Ok(())
            }
        }
    }
}
