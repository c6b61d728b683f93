use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::node::{Address, Hash32};
use crate::pow::DIFF_SCALE;

const RECENT_SHARES_PER_WORKER: usize = 100;
const HASHRATE_WINDOW_SECS: u64 = 600;
const SHARE_HISTORY_RETENTION_MS: u64 = 24 * 3600 * 1000;
const MINER_INACTIVITY_MS: u64 = 3600 * 1000;

/// One accepted share. Difficulty is carried in milli-units so the reward
/// split stays in integer arithmetic end to end.
#[derive(Clone, Debug, Serialize)]
pub struct Contribution {
    pub address: Address,
    pub worker: Option<String>,
    pub difficulty_millis: u64,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WorkerStats {
    pub shares: u64,
    pub last_active_ms: u64,
    #[serde(skip)]
    recent: VecDeque<(u64, u64)>, // (timestamp_ms, difficulty_millis)
}

impl WorkerStats {
    fn record(&mut self, timestamp_ms: u64, difficulty_millis: u64) {
        self.shares += 1;
        self.last_active_ms = timestamp_ms;
        self.recent.push_back((timestamp_ms, difficulty_millis));
        while self.recent.len() > RECENT_SHARES_PER_WORKER {
            self.recent.pop_front();
        }
    }

    /// `Σ difficulty · 2³² / window` over the trailing ten minutes.
    pub fn hashrate(&self, now_ms: u64) -> f64 {
        let cutoff = now_ms.saturating_sub(HASHRATE_WINDOW_SECS * 1000);
        let millis: u64 = self
            .recent
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, d)| *d)
            .sum();
        (millis as f64 / DIFF_SCALE as f64) * 4294967296.0 / HASHRATE_WINDOW_SECS as f64
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MinerStats {
    pub shares: u64,
    pub accepted_difficulty_millis: u64,
    pub last_active_ms: u64,
    pub workers: HashMap<String, WorkerStats>,
}

impl MinerStats {
    pub fn hashrate(&self, now_ms: u64) -> f64 {
        self.workers.values().map(|w| w.hashrate(now_ms)).sum()
    }
}

struct LedgerInner {
    seen: HashMap<Hash32, HashSet<u64>>,
    window: VecDeque<Contribution>,
    miners: HashMap<Address, MinerStats>,
    share_times: VecDeque<u64>,
    accepted: u64,
    rejected: u64,
    accepted_difficulty_millis: u128,
}

/// Live share accounting: per-template nonce dedup, the bounded PPLNS window
/// and per-miner statistics. Writers funnel through short write-lock sections;
/// readers get copies.
pub struct ShareLedger {
    inner: RwLock<LedgerInner>,
    pplns_window: usize,
}

impl ShareLedger {
    pub fn new(pplns_window: usize) -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                seen: HashMap::new(),
                window: VecDeque::new(),
                miners: HashMap::new(),
                share_times: VecDeque::new(),
                accepted: 0,
                rejected: 0,
                accepted_difficulty_millis: 0,
            }),
            pplns_window,
        }
    }

    pub async fn is_duplicate(&self, template: &Hash32, nonce: u64) -> bool {
        self.inner
            .read()
            .await
            .seen
            .get(template)
            .is_some_and(|set| set.contains(&nonce))
    }

    /// Admit one validated share. Returns `None` when the nonce raced in from
    /// a concurrent submission (never double-accept); otherwise the window
    /// snapshot requested by a block hit, copied inside the same write section
    /// so nothing admitted later can leak into it.
    pub async fn record(
        &self,
        template: Hash32,
        nonce: u64,
        contribution: Contribution,
        snapshot_for_block: bool,
    ) -> Option<Vec<Contribution>> {
        let mut inner = self.inner.write().await;
        if !inner.seen.entry(template).or_default().insert(nonce) {
            return None;
        }

        let now_ms = contribution.timestamp_ms;
        inner.share_times.push_back(now_ms);
        let history_cutoff = now_ms.saturating_sub(SHARE_HISTORY_RETENTION_MS);
        while inner
            .share_times
            .front()
            .is_some_and(|ts| *ts < history_cutoff)
        {
            inner.share_times.pop_front();
        }

        let miner = inner.miners.entry(contribution.address.clone()).or_default();
        miner.shares += 1;
        miner.accepted_difficulty_millis += contribution.difficulty_millis;
        miner.last_active_ms = now_ms;
        miner
            .workers
            .entry(contribution.worker.clone().unwrap_or_default())
            .or_default()
            .record(now_ms, contribution.difficulty_millis);

        inner.accepted += 1;
        inner.accepted_difficulty_millis += contribution.difficulty_millis as u128;

        inner.window.push_back(contribution);
        while inner.window.len() > self.pplns_window {
            inner.window.pop_front();
        }

        if snapshot_for_block {
            Some(inner.window.iter().cloned().collect())
        } else {
            Some(Vec::new())
        }
    }

    pub async fn note_rejected(&self) {
        self.inner.write().await.rejected += 1;
    }

    /// Copy of the live PPLNS window; the window itself is never cleared.
    #[allow(dead_code)]
    pub async fn window_snapshot(&self) -> Vec<Contribution> {
        self.inner.read().await.window.iter().cloned().collect()
    }

    pub async fn window_len(&self) -> usize {
        self.inner.read().await.window.len()
    }

    pub async fn counters(&self) -> (u64, u64) {
        let inner = self.inner.read().await;
        (inner.accepted, inner.rejected)
    }

    pub async fn miner_stats(&self, address: &Address) -> Option<MinerStats> {
        self.inner.read().await.miners.get(address).cloned()
    }

    pub async fn miners_snapshot(&self) -> HashMap<Address, MinerStats> {
        self.inner.read().await.miners.clone()
    }

    /// Sum of per-miner trailing-window hashrates.
    pub async fn pool_hashrate(&self, now_ms: u64) -> f64 {
        let inner = self.inner.read().await;
        inner.miners.values().map(|m| m.hashrate(now_ms)).sum()
    }

    /// Whole-uptime variant: `Σ accepted difficulty · 2³² / uptime`.
    pub async fn lifetime_hashrate(&self, uptime_secs: u64) -> f64 {
        if uptime_secs == 0 {
            return 0.0;
        }
        let inner = self.inner.read().await;
        (inner.accepted_difficulty_millis as f64 / DIFF_SCALE as f64) * 4294967296.0
            / uptime_secs as f64
    }

    /// Accepted shares in the trailing `window_secs`, for rate reporting.
    pub async fn share_rate(&self, now_ms: u64, window_secs: u64) -> u64 {
        let cutoff = now_ms.saturating_sub(window_secs * 1000);
        self.inner
            .read()
            .await
            .share_times
            .iter()
            .filter(|ts| **ts >= cutoff)
            .count() as u64
    }

    /// Dedup state follows template lifetime: drop sets whose template left
    /// the cache.
    pub async fn retain_templates(&self, live: &HashSet<Hash32>) {
        self.inner
            .write()
            .await
            .seen
            .retain(|hash, _| live.contains(hash));
    }

    /// Periodic cleanup: inactive miners and stale share history out.
    pub async fn cleanup(&self, now_ms: u64) {
        let mut inner = self.inner.write().await;
        inner
            .miners
            .retain(|_, m| now_ms.saturating_sub(m.last_active_ms) <= MINER_INACTIVITY_MS);
        let cutoff = now_ms.saturating_sub(SHARE_HISTORY_RETENTION_MS);
        while inner.share_times.front().is_some_and(|ts| *ts < cutoff) {
            inner.share_times.pop_front();
        }
    }
}
