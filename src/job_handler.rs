use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::node::{Hash32, NodeError, NodeEvent, NodeRpc, RejectReason, RpcBlock, SubmitBlockReport};
use crate::pow::{hash_header, PowState};

const JOB_CHANNEL_CAPACITY: usize = 24;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(5);
const SUBMIT_RETRY_BUDGET: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("template not found")]
    TemplateNotFound,
    #[error("block rejected by node: {0}")]
    BlockInvalid(String),
    #[error("node kept rejecting transiently for {0:?}")]
    RetriesExhausted(Duration),
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// One candidate block plus its proof-of-work state.
pub struct Template {
    pub block: RpcBlock,
    pub pow: PowState,
}

/// Emitted when a fresh job is ready to broadcast.
#[derive(Clone, Debug)]
pub struct JobParams {
    pub job_id: String,
    pub pre_pow_hash: Hash32,
    pub timestamp: u64,
}

// ── Job registry ────────────────────────────────────────────────────────────

/// Short session-facing job ids, insertion-ordered. The id is derived from the
/// pre-PoW hash (first four bytes, hex) so re-minting the same hash is a no-op.
#[derive(Default)]
pub struct JobRegistry {
    ids: HashMap<String, Hash32>,
    order: VecDeque<String>,
}

pub fn job_id_for(hash: &Hash32) -> String {
    hex::encode(&hash.as_bytes()[..4])
}

impl JobRegistry {
    /// Returns the job id and, on the rare id-prefix collision, the hash of
    /// the template the new one displaces.
    pub fn mint(&mut self, hash: Hash32) -> (String, Option<Hash32>) {
        let id = job_id_for(&hash);
        match self.ids.insert(id.clone(), hash) {
            None => {
                self.order.push_back(id.clone());
                (id, None)
            }
            Some(previous) if previous == hash => (id, None),
            Some(previous) => (id, Some(previous)),
        }
    }

    pub fn lookup(&self, job_id: &str) -> Option<Hash32> {
        self.ids.get(job_id).copied()
    }

    pub fn expire_oldest(&mut self) -> Option<Hash32> {
        let id = self.order.pop_front()?;
        self.ids.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

// ── Template cache ──────────────────────────────────────────────────────────

/// Recent templates keyed by pre-PoW hash, FIFO-bounded to the DAA window.
pub struct TemplateCache {
    templates: HashMap<Hash32, Template>,
    order: VecDeque<Hash32>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.templates.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash32) -> Option<&Template> {
        self.templates.get(hash)
    }

    pub fn insert(&mut self, hash: Hash32, template: Template) {
        if self.templates.insert(hash, template).is_none() {
            self.order.push_back(hash);
        }
    }

    pub fn remove(&mut self, hash: &Hash32) {
        if self.templates.remove(hash).is_some() {
            self.order.retain(|h| h != hash);
        }
    }

    pub fn evict_oldest(&mut self) -> Option<Hash32> {
        let hash = self.order.pop_front()?;
        self.templates.remove(&hash);
        Some(hash)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn live_hashes(&self) -> Vec<Hash32> {
        self.order.iter().copied().collect()
    }
}

struct JobsInner {
    registry: JobRegistry,
    cache: TemplateCache,
}

// ── Template service ────────────────────────────────────────────────────────

/// Pulls templates from the node on every new-template event, keeps the
/// registry and cache in lockstep, fans jobs out through a broadcast channel
/// and resubmits solved blocks with transient-reject retry.
pub struct JobHandler {
    node: Arc<dyn NodeRpc>,
    pay_address: crate::node::Address,
    extra_data: String,
    daa_window: usize,
    inner: RwLock<JobsInner>,
    job_tx: broadcast::Sender<JobParams>,
    stuck_submissions: AtomicU64,
}

impl JobHandler {
    pub fn new(
        node: Arc<dyn NodeRpc>,
        pay_address: crate::node::Address,
        extra_data: String,
        daa_window: usize,
    ) -> Self {
        let (job_tx, _) = broadcast::channel(JOB_CHANNEL_CAPACITY);
        Self {
            node,
            pay_address,
            extra_data,
            daa_window,
            inner: RwLock::new(JobsInner {
                registry: JobRegistry::default(),
                cache: TemplateCache::new(),
            }),
            job_tx,
            stuck_submissions: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobParams> {
        self.job_tx.subscribe()
    }

    /// Count of submissions that ran out their transient-retry budget; the
    /// status API exposes this so an operator can alert on stuck submissions.
    pub fn stuck_submissions(&self) -> u64 {
        self.stuck_submissions.load(Ordering::Relaxed)
    }

    /// Event loop: one template fetched up front, then one per node event.
    /// Re-subscribes after the node connection drops.
    pub async fn run(self: Arc<Self>) {
        loop {
            let mut events = self.node.events();
            if let Err(e) = self.ingest().await {
                warn!(target: "jobs", "initial template fetch failed: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            loop {
                match events.recv().await {
                    Ok(NodeEvent::NewBlockTemplate) => {
                        if let Err(e) = self.ingest().await {
                            warn!(target: "jobs", "template fetch failed: {e}");
                        }
                    }
                    Ok(_) => {} // maturity events are consumed elsewhere
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "jobs", "event stream lagged by {n}; catching up");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(target: "jobs", "node event stream closed; re-subscribing");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        break;
                    }
                }
            }
        }
    }

    /// Fetch one template and register it. Idempotent on the pre-PoW hash:
    /// a hash already in the cache mints nothing and broadcasts nothing.
    pub async fn ingest(&self) -> Result<Option<JobParams>, NodeError> {
        let block = self
            .node
            .get_block_template(&self.pay_address, &self.extra_data)
            .await?;
        let pow = PowState::new(&block.header);
        let hash = pow.pre_pow_hash();
        let timestamp = pow.timestamp();
        let network_difficulty = crate::pow::target_to_difficulty(pow.network_target());

        let mut inner = self.inner.write().await;
        if inner.cache.contains(&hash) {
            debug!(target: "jobs", "template {hash} already known, dropping");
            return Ok(None);
        }

        inner.cache.insert(hash, Template { block, pow });
        let (job_id, displaced) = inner.registry.mint(hash);
        if let Some(old) = displaced {
            // Keep registry and cache in lockstep when a job id collides.
            inner.cache.remove(&old);
            warn!(target: "jobs", "job id {job_id} reassigned from {old} to {hash}");
        }
        while inner.cache.len() > self.daa_window {
            inner.cache.evict_oldest();
            inner.registry.expire_oldest();
        }
        drop(inner);

        let params = JobParams {
            job_id,
            pre_pow_hash: hash,
            timestamp,
        };
        debug!(
            target: "jobs",
            "new job {} for template {} at network difficulty {network_difficulty:.0}",
            params.job_id, hash
        );
        let _ = self.job_tx.send(params.clone());
        Ok(Some(params))
    }

    pub async fn lookup_job(&self, job_id: &str) -> Option<Hash32> {
        self.inner.read().await.registry.lookup(job_id)
    }

    /// The PoW state for a cached template, cloned out so share validation
    /// never holds the jobs lock across an await.
    pub async fn template_pow(&self, hash: &Hash32) -> Option<PowState> {
        self.inner.read().await.cache.get(hash).map(|t| t.pow.clone())
    }

    pub async fn live_template_hashes(&self) -> Vec<Hash32> {
        self.inner.read().await.cache.live_hashes()
    }

    pub async fn job_count(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.registry.len(), inner.cache.len())
    }

    /// Stamp the winning nonce into the cached template and hand the block to
    /// the node. `IsInIBD` and `RouteIsFull` are waited out (the node is the
    /// source of truth), everything else fails the submission; the template
    /// stays cached until normal eviction either way.
    pub async fn submit(&self, pre_pow_hash: Hash32, nonce: u64) -> Result<Hash32, SubmitError> {
        let mut block = {
            let inner = self.inner.read().await;
            inner
                .cache
                .get(&pre_pow_hash)
                .map(|t| t.block.clone())
                .ok_or(SubmitError::TemplateNotFound)?
        };
        block.header.nonce = nonce;
        let block_hash = hash_header(&block.header, false);

        let started = tokio::time::Instant::now();
        loop {
            match self.node.submit_block(block.clone(), false).await? {
                SubmitBlockReport::Success => {
                    info!(target: "jobs", "block {block_hash} accepted by node");
                    return Ok(block_hash);
                }
                SubmitBlockReport::Reject(
                    reason @ (RejectReason::IsInIBD | RejectReason::RouteIsFull),
                ) => {
                    let elapsed = started.elapsed();
                    if elapsed >= SUBMIT_RETRY_BUDGET {
                        self.stuck_submissions.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target: "jobs",
                            "giving up on block {block_hash} after {elapsed:?} of {reason}"
                        );
                        return Err(SubmitError::RetriesExhausted(elapsed));
                    }
                    warn!(
                        target: "jobs",
                        "node rejected block {block_hash} with {reason}, retrying in {SUBMIT_RETRY_DELAY:?}"
                    );
                    tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
                }
                SubmitBlockReport::Reject(RejectReason::BlockInvalid(why)) => {
                    warn!(target: "jobs", "node rejected block {block_hash}: {why}");
                    return Err(SubmitError::BlockInvalid(why));
                }
            }
        }
    }
}
