//! Persistent pool state: miner balances, payout history and the hashrate
//! ring, hydrated from a single JSON snapshot file that is atomically
//! overwritten by a background flush task. An optional append-only payout
//! ledger (one JSONL file per UTC day) survives snapshot rewrites.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::handle_rewards::PayoutOutput;
use crate::node::Address;

const RECENT_PAYOUTS_CAP: usize = 200;
const HASHRATE_POINTS_CAP: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Totals {
    pub blocks_found: u64,
    pub blocks_orphaned: u64,
    pub total_paid: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LastBlock {
    pub hash: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub txids: Vec<String>,
    pub outputs: Vec<PayoutOutput>,
    pub total: u64,
    pub block_hash: String,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default)]
pub struct HashratePoint {
    pub t: u64,
    pub v: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StoreSnapshot {
    pub generated_at: u64,
    pub totals: Totals,
    #[serde(default)]
    pub last_block: LastBlock,
    /// address -> balance in sompi
    #[serde(default)]
    pub balances: BTreeMap<String, u64>,
    #[serde(default)]
    pub recent_payouts: Vec<PayoutRecord>,
    #[serde(default)]
    pub hashrate_history: Vec<HashratePoint>,
}

#[derive(Debug)]
struct Inner {
    snapshot: StoreSnapshot,
    dirty: bool,
    state_file: PathBuf,
    ledger_enable: bool,
    ledger_dir: PathBuf,
}

#[derive(Clone)]
pub struct PoolState {
    inner: Arc<Mutex<Inner>>,
}

impl PoolState {
    /// Load (or start fresh) from `state_file`. The flush task is spawned
    /// separately so callers control persistence cadence.
    pub async fn open(
        state_file: PathBuf,
        ledger_dir: PathBuf,
        ledger_enable: bool,
    ) -> anyhow::Result<Self> {
        let mut snapshot = StoreSnapshot::default();
        match tokio::fs::read(&state_file).await {
            Ok(bytes) => {
                snapshot = serde_json::from_slice(&bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        snapshot.generated_at = now_ts();

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                snapshot,
                dirty: false,
                state_file,
                ledger_enable,
                ledger_dir,
            })),
        })
    }

    pub fn spawn_flush_task(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) = this.flush_if_dirty().await {
                    warn!(target: "store", "state flush failed: {e}");
                }
            }
        });
    }

    // ── Balances ────────────────────────────────────────────────────────────

    pub async fn get_miner(&self, address: &Address) -> u64 {
        let g = self.inner.lock().await;
        g.snapshot
            .balances
            .get(address.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Apply one signed balance delta. Negative deltas floor at zero.
    pub async fn add_balance(&self, address: &Address, delta: i64) {
        let mut g = self.inner.lock().await;
        let entry = g.snapshot.balances.entry(address.as_str().to_string()).or_insert(0);
        let next = (*entry as i128 + delta as i128).max(0);
        *entry = next.min(u64::MAX as i128) as u64;
        g.dirty = true;
    }

    /// Credit a whole reward split in one transaction.
    pub async fn credit_many(&self, rewards: &[PayoutOutput]) {
        let mut g = self.inner.lock().await;
        for r in rewards {
            *g.snapshot
                .balances
                .entry(r.address.as_str().to_string())
                .or_insert(0) += r.amount;
        }
        g.dirty = true;
    }

    /// Move every balance at or above `threshold` into a payout batch,
    /// zeroing the persisted balance in the same transaction.
    pub async fn drain_for_payout(&self, threshold: u64, prefix: &str) -> Vec<PayoutOutput> {
        let mut g = self.inner.lock().await;
        let mut batch = Vec::new();
        for (address, balance) in g.snapshot.balances.iter_mut() {
            if *balance >= threshold && *balance > 0 {
                if let Some(parsed) = Address::parse(address, prefix) {
                    batch.push(PayoutOutput {
                        address: parsed,
                        amount: *balance,
                    });
                    *balance = 0;
                }
            }
        }
        g.snapshot.balances.retain(|_, v| *v > 0);
        if !batch.is_empty() {
            g.dirty = true;
        }
        batch
    }

    // ── History ─────────────────────────────────────────────────────────────

    pub async fn record_block(&self, hash: &str, timestamp: u64) {
        let mut g = self.inner.lock().await;
        g.snapshot.totals.blocks_found += 1;
        g.snapshot.last_block = LastBlock {
            hash: hash.to_string(),
            timestamp,
        };
        g.dirty = true;
    }

    pub async fn record_orphan(&self) {
        let mut g = self.inner.lock().await;
        g.snapshot.totals.blocks_orphaned += 1;
        g.dirty = true;
    }

    pub async fn record_payout(&self, record: PayoutRecord) {
        let mut g = self.inner.lock().await;
        g.snapshot.totals.total_paid += record.total;
        if g.ledger_enable {
            if let Err(e) = append_ledger_line(&g.ledger_dir, &record) {
                warn!(target: "store", "payout ledger append failed: {e}");
            }
        }
        g.snapshot.recent_payouts.push(record);
        while g.snapshot.recent_payouts.len() > RECENT_PAYOUTS_CAP {
            g.snapshot.recent_payouts.remove(0);
        }
        g.dirty = true;
    }

    pub async fn record_hashrate(&self, value: f64) {
        let mut g = self.inner.lock().await;
        g.snapshot.hashrate_history.push(HashratePoint {
            t: now_ts(),
            v: value,
        });
        while g.snapshot.hashrate_history.len() > HASHRATE_POINTS_CAP {
            g.snapshot.hashrate_history.remove(0);
        }
        g.dirty = true;
    }

    pub async fn recent_payouts(&self) -> Vec<PayoutRecord> {
        self.inner.lock().await.snapshot.recent_payouts.clone()
    }

    pub async fn hashrate_history(&self) -> Vec<HashratePoint> {
        self.inner.lock().await.snapshot.hashrate_history.clone()
    }

    pub async fn totals(&self) -> Totals {
        self.inner.lock().await.snapshot.totals.clone()
    }

    pub async fn last_block(&self) -> LastBlock {
        self.inner.lock().await.snapshot.last_block.clone()
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    pub async fn flush_if_dirty(&self) -> anyhow::Result<()> {
        let (json, path) = {
            let mut g = self.inner.lock().await;
            if !g.dirty {
                return Ok(());
            }
            g.snapshot.generated_at = now_ts();
            let json = serde_json::to_vec_pretty(&g.snapshot)?;
            g.dirty = false;
            (json, g.state_file.clone())
        };

        let tmp = path.with_extension("json.tmp");
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&tmp, &json)?;
            std::fs::rename(&tmp, &path)
        })
        .await??;
        Ok(())
    }
}

fn append_ledger_line(ledger_dir: &Path, record: &PayoutRecord) -> anyhow::Result<()> {
    let day = Utc
        .timestamp_opt(record.timestamp as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let path = ledger_dir.join(format!("payout_ledger_{day}.jsonl"));

    std::fs::create_dir_all(ledger_dir)?;
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

fn now_ts() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
