use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::handle_rewards::{carve_fee, split_rewards, PayoutSender};
use crate::node::{Address, Hash32, NodeRpc};
use crate::poolstate::{PayoutRecord, PoolState};
use crate::share_store::Contribution;

const TERMINAL_RECORD_RETENTION_MS: u64 = 48 * 3600 * 1000;

/// Sent by the share path once the node has accepted a block we submitted.
#[derive(Debug)]
pub struct BlockFound {
    pub block_hash: Hash32,
    pub contributions: Vec<Contribution>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Submitted,
    Mature,
    Orphaned,
}

struct BlockRecord {
    contributions: Vec<Contribution>,
    submitted_at_ms: u64,
    status: BlockStatus,
    reward_net: Option<u64>,
}

/// Row shape served by the read API.
#[derive(Clone, Debug, Serialize)]
pub struct BlockRecordView {
    pub hash: String,
    pub status: BlockStatus,
    pub submitted_at_ms: u64,
    pub contributors: usize,
    pub total_difficulty_millis: u64,
    pub reward_net: Option<u64>,
}

pub struct BlockAccountConfig {
    pub fee_percent: f64,
    pub operator_address: Address,
    pub payment_threshold: u64,
    pub address_prefix: String,
}

/// Tracks submitted blocks and turns coinbase maturity into balance credits
/// and payout batches.
pub struct BlockAccount {
    records: Mutex<HashMap<Hash32, BlockRecord>>,
    node: Arc<dyn NodeRpc>,
    store: PoolState,
    payout: Arc<dyn PayoutSender>,
    config: BlockAccountConfig,
}

impl BlockAccount {
    pub fn new(
        node: Arc<dyn NodeRpc>,
        store: PoolState,
        payout: Arc<dyn PayoutSender>,
        config: BlockAccountConfig,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            node,
            store,
            payout,
            config,
        }
    }

    /// Snapshot of accepted-block contributions, stored at acceptance time.
    pub async fn on_block_found(&self, found: BlockFound) {
        let now = now_ms();
        info!(
            target: "blocks",
            "block {} accepted with {} contributions in window",
            found.block_hash,
            found.contributions.len()
        );
        self.store
            .record_block(&found.block_hash.to_hex(), now / 1000)
            .await;
        self.records.lock().await.insert(
            found.block_hash,
            BlockRecord {
                contributions: found.contributions,
                submitted_at_ms: now,
                status: BlockStatus::Submitted,
                reward_net: None,
            },
        );
    }

    /// Coinbase maturity for one of our blocks: verify it stayed blue, carve
    /// the pool fee (credited to the operator through the same ledger), split
    /// the rest over the stored snapshot, then drain ripe balances into a
    /// payout batch.
    pub async fn on_maturity(&self, block_hash: Hash32, gross: u64, daa_score: u64) {
        let contributions = {
            let records = self.records.lock().await;
            match records.get(&block_hash) {
                Some(r) if r.status == BlockStatus::Submitted => r.contributions.clone(),
                Some(r) => {
                    warn!(
                        target: "blocks",
                        "maturity for block {block_hash} already settled as {:?}", r.status
                    );
                    return;
                }
                None => {
                    warn!(target: "blocks", "maturity for unknown block {block_hash}");
                    return;
                }
            }
        };

        let blue = match self.node.get_block_color(&block_hash).await {
            Ok(blue) => blue,
            Err(e) => {
                warn!(target: "blocks", "color check for {block_hash} failed: {e}");
                return; // stays Submitted; a later maturity event can retry
            }
        };

        if !blue {
            info!(target: "blocks", "block {block_hash} went red, skipping rewards");
            self.set_status(&block_hash, BlockStatus::Orphaned, None).await;
            self.store.record_orphan().await;
            return;
        }

        let (fee, net) = carve_fee(gross, self.config.fee_percent);
        info!(
            target: "blocks",
            "block {block_hash} matured at daa {daa_score}: gross {gross}, fee {fee}, net {net}"
        );
        if fee > 0 {
            self.store
                .add_balance(&self.config.operator_address, fee.min(i64::MAX as u64) as i64)
                .await;
        }

        let rewards = split_rewards(&contributions, net);
        self.store.credit_many(&rewards).await;
        self.set_status(&block_hash, BlockStatus::Mature, Some(net)).await;

        self.settle_payouts(&block_hash).await;
    }

    async fn settle_payouts(&self, block_hash: &Hash32) {
        let batch = self
            .store
            .drain_for_payout(self.config.payment_threshold, &self.config.address_prefix)
            .await;
        if batch.is_empty() {
            return;
        }
        let total: u64 = batch.iter().map(|o| o.amount).sum();

        if let Ok(estimate) = self.node.get_fee_estimate().await {
            debug!(target: "blocks", "sending payout batch at fee estimate {estimate}");
        }

        match self.payout.send(&batch).await {
            Ok(txids) => {
                info!(
                    target: "blocks",
                    "paid {} miners {total} sompi in {} tx(s)", batch.len(), txids.len()
                );
                self.store
                    .record_payout(PayoutRecord {
                        txids,
                        outputs: batch,
                        total,
                        block_hash: block_hash.to_hex(),
                        timestamp: now_ms() / 1000,
                    })
                    .await;
            }
            Err(e) => {
                // Restore the drained balances so nothing is lost; the next
                // maturity will retry the batch.
                warn!(target: "blocks", "payout send failed, re-crediting batch: {e}");
                self.store.credit_many(&batch).await;
            }
        }
    }

    async fn set_status(&self, hash: &Hash32, status: BlockStatus, reward_net: Option<u64>) {
        if let Some(record) = self.records.lock().await.get_mut(hash) {
            record.status = status;
            if reward_net.is_some() {
                record.reward_net = reward_net;
            }
        }
    }

    pub async fn records_snapshot(&self) -> Vec<BlockRecordView> {
        let records = self.records.lock().await;
        let mut views: Vec<BlockRecordView> = records
            .iter()
            .map(|(hash, r)| BlockRecordView {
                hash: hash.to_hex(),
                status: r.status,
                submitted_at_ms: r.submitted_at_ms,
                contributors: r.contributions.len(),
                total_difficulty_millis: r
                    .contributions
                    .iter()
                    .map(|c| c.difficulty_millis)
                    .sum(),
                reward_net: r.reward_net,
            })
            .collect();
        views.sort_by(|a, b| b.submitted_at_ms.cmp(&a.submitted_at_ms));
        views
    }

    /// Drop terminal records once they have aged out.
    pub async fn cleanup(&self, now_ms: u64) {
        self.records.lock().await.retain(|_, r| {
            r.status == BlockStatus::Submitted
                || now_ms.saturating_sub(r.submitted_at_ms) <= TERMINAL_RECORD_RETENTION_MS
        });
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
