use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

use crate::handle_block::{BlockAccount, BlockAccountConfig, BlockFound};
use crate::handle_rewards::PayoutSender;
use crate::job_handler::JobHandler;
use crate::node::{Address, NodeEvent, NodeRpc};
use crate::pool_api_server::{ApiState, PoolApiServer};
use crate::poolstate::PoolState;
use crate::share_store::ShareLedger;
use crate::stratum_server::{StratumConfig, StratumServer};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const HASHRATE_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

pub struct PoolConfig {
    pub pay_address: Address,
    pub operator_address: Address,
    pub extra_data: String,
    pub address_prefix: String,
    pub fee_percent: f64,
    pub payment_threshold: u64,
    pub daa_window: usize,
    pub pplns_window: usize,
    pub initial_difficulty: f64,
    pub stratum_bind: SocketAddr,
    pub api_bind: SocketAddr,
}

/// Owns the wiring between the node, the job pipeline, the miner sessions and
/// the reward path, plus the background tickers.
pub struct Pool {
    pub jobs: Arc<JobHandler>,
    pub ledger: Arc<ShareLedger>,
    pub account: Arc<BlockAccount>,
    pub stratum: Arc<StratumServer>,
    pub store: PoolState,
    node: Arc<dyn NodeRpc>,
    block_tx: mpsc::UnboundedSender<BlockFound>,
    block_rx: Option<mpsc::UnboundedReceiver<BlockFound>>,
    api_bind: SocketAddr,
    address_prefix: String,
    started_at_ms: u64,
}

impl Pool {
    pub fn new(
        node: Arc<dyn NodeRpc>,
        store: PoolState,
        payout: Arc<dyn PayoutSender>,
        config: PoolConfig,
    ) -> Self {
        let jobs = Arc::new(JobHandler::new(
            node.clone(),
            config.pay_address.clone(),
            config.extra_data.clone(),
            config.daa_window,
        ));
        let ledger = Arc::new(ShareLedger::new(config.pplns_window));
        let account = Arc::new(BlockAccount::new(
            node.clone(),
            store.clone(),
            payout,
            BlockAccountConfig {
                fee_percent: config.fee_percent,
                operator_address: config.operator_address,
                payment_threshold: config.payment_threshold,
                address_prefix: config.address_prefix.clone(),
            },
        ));

        let (block_tx, block_rx) = mpsc::unbounded_channel();
        let stratum = Arc::new(StratumServer::new(
            jobs.clone(),
            ledger.clone(),
            block_tx.clone(),
            StratumConfig {
                bind: config.stratum_bind,
                initial_difficulty: config.initial_difficulty,
                address_prefix: config.address_prefix.clone(),
            },
        ));

        Self {
            jobs,
            ledger,
            account,
            stratum,
            store,
            node,
            block_tx,
            block_rx: Some(block_rx),
            api_bind: config.api_bind,
            address_prefix: config.address_prefix,
            started_at_ms: now_ms(),
        }
    }

    /// Share path entry for callers that bypass the TCP listener.
    #[allow(dead_code)]
    pub fn block_sender(&self) -> mpsc::UnboundedSender<BlockFound> {
        self.block_tx.clone()
    }

    /// Background plumbing: template ingest, job fan-out, block accounting,
    /// maturity settlement and the two tickers. Listeners are bound in `run`.
    pub fn spawn_background(&mut self) {
        tokio::spawn(self.jobs.clone().run());

        // job-ready -> mining.notify fan-out
        let jobs = self.jobs.clone();
        let broadcaster = self.stratum.broadcaster.clone();
        tokio::spawn(async move {
            let mut rx = jobs.subscribe();
            loop {
                match rx.recv().await {
                    Ok(job) => broadcaster.notify_job(&job).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "pool", "job fan-out lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // accepted blocks -> account snapshots
        let account = self.account.clone();
        let mut block_rx = self.block_rx.take().expect("spawn_background called twice");
        tokio::spawn(async move {
            while let Some(found) = block_rx.recv().await {
                account.on_block_found(found).await;
            }
        });

        // coinbase maturity -> reward settlement
        let node = self.node.clone();
        let account = self.account.clone();
        tokio::spawn(async move {
            loop {
                let mut events = node.events();
                loop {
                    match events.recv().await {
                        Ok(NodeEvent::CoinbaseMaturity {
                            block_hash,
                            amount,
                            daa_score,
                        }) => account.on_maturity(block_hash, amount, daa_score).await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(target: "pool", "maturity stream lagged by {n}");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            break;
                        }
                    }
                }
            }
        });

        // cleanup ticker: stale miners, aged share history, settled blocks,
        // dedup sets whose template left the cache
        let ledger = self.ledger.clone();
        let account = self.account.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tick.tick().await;
                let now = now_ms();
                ledger.cleanup(now).await;
                account.cleanup(now).await;
                let live = jobs.live_template_hashes().await.into_iter().collect();
                ledger.retain_templates(&live).await;
            }
        });

        // hashrate snapshot ticker
        let ledger = self.ledger.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HASHRATE_SNAPSHOT_INTERVAL);
            loop {
                tick.tick().await;
                let rate = ledger.pool_hashrate(now_ms()).await;
                store.record_hashrate(rate).await;
            }
        });
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            ledger: self.ledger.clone(),
            account: self.account.clone(),
            store: self.store.clone(),
            jobs: self.jobs.clone(),
            broadcaster: self.stratum.broadcaster.clone(),
            address_prefix: self.address_prefix.clone(),
            started_at_ms: self.started_at_ms,
        }
    }

    /// Bring the whole pool up and serve until a listener dies.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.spawn_background();
        self.store.spawn_flush_task();

        let api = PoolApiServer::new(self.api_bind, self.api_state());
        let mut api_task = tokio::spawn(api.listen());

        let stratum_handle = self.stratum.clone().listen().await?;

        tokio::select! {
            result = &mut api_task => {
                let result = result?;
                error!(target: "pool", "status api stopped");
                result
            }
            result = stratum_handle => {
                error!(target: "pool", "stratum listener stopped");
                result.map_err(Into::into)
            }
        }
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
