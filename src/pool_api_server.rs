//! Read-only JSON API for operators and dashboards. Everything served here is
//! a copy of live state; nothing mutates the pool.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::handle_block::BlockAccount;
use crate::job_handler::JobHandler;
use crate::node::Address;
use crate::poolstate::PoolState;
use crate::share_store::ShareLedger;
use crate::stratum_server::Broadcaster;

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<ShareLedger>,
    pub account: Arc<BlockAccount>,
    pub store: PoolState,
    pub jobs: Arc<JobHandler>,
    pub broadcaster: Arc<Broadcaster>,
    pub address_prefix: String,
    pub started_at_ms: u64,
}

pub struct PoolApiServer {
    bind: SocketAddr,
    state: ApiState,
}

impl PoolApiServer {
    pub fn new(bind: SocketAddr, state: ApiState) -> Self {
        Self { bind, state }
    }

    pub async fn listen(self) -> anyhow::Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/status", get(status_handler))
            .route("/miner", get(miner_handler))
            .route("/miners", get(miners_handler))
            .route("/blocks", get(blocks_handler))
            .route("/payouts", get(payouts_handler))
            .route("/hashrate-history", get(hashrate_history_handler))
            .route("/version", get(version_handler))
            .layer(cors)
            .with_state(self.state);

        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!(target: "api", "status api listening on http://{}", self.bind);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn status_handler(State(state): State<ApiState>) -> Json<Value> {
    let now = now_ms();
    let uptime_secs = now.saturating_sub(state.started_at_ms) / 1000;
    let (accepted, rejected) = state.ledger.counters().await;
    let (job_count, template_count) = state.jobs.job_count().await;
    let totals = state.store.totals().await;

    Json(json!({
        "uptimeSecs": uptime_secs,
        "sessions": state.broadcaster.session_count().await,
        "authorizedSessions": state.broadcaster.authorized_count().await,
        "miners": state.broadcaster.address_count().await,
        "poolHashrate": state.ledger.pool_hashrate(now).await,
        "lifetimeHashrate": state.ledger.lifetime_hashrate(uptime_secs).await,
        "sharesAccepted": accepted,
        "sharesRejected": rejected,
        "sharesLastHour": state.ledger.share_rate(now, 3600).await,
        "windowSize": state.ledger.window_len().await,
        "jobs": job_count,
        "templates": template_count,
        "stuckSubmissions": state.jobs.stuck_submissions(),
        "blocksFound": totals.blocks_found,
        "blocksOrphaned": totals.blocks_orphaned,
        "totalPaid": totals.total_paid,
        "lastBlock": state.store.last_block().await,
    }))
}

async fn miner_handler(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let raw = params.get("address").cloned().unwrap_or_default();
    let address = Address::parse(&raw, &state.address_prefix).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid address"})),
        )
    })?;

    let now = now_ms();
    let balance = state.store.get_miner(&address).await;
    let stats = state.ledger.miner_stats(&address).await;
    let hashrate = stats.as_ref().map(|s| s.hashrate(now)).unwrap_or(0.0);
    let workers: Value = stats
        .as_ref()
        .map(|s| {
            s.workers
                .iter()
                .map(|(name, w)| {
                    (
                        name.clone(),
                        json!({
                            "shares": w.shares,
                            "lastActiveMs": w.last_active_ms,
                            "hashrate": w.hashrate(now),
                        }),
                    )
                })
                .collect::<serde_json::Map<String, Value>>()
                .into()
        })
        .unwrap_or_else(|| json!({}));

    Ok(Json(json!({
        "address": address,
        "balance": balance,
        "sessions": state.broadcaster.sessions_for(&address).await,
        "shares": stats.as_ref().map(|s| s.shares).unwrap_or(0),
        "hashrate": hashrate,
        "workers": workers,
    })))
}

async fn miners_handler(State(state): State<ApiState>) -> Json<Value> {
    let now = now_ms();
    let miners = state.ledger.miners_snapshot().await;
    let rows: serde_json::Map<String, Value> = miners
        .iter()
        .map(|(address, stats)| {
            (
                address.as_str().to_string(),
                json!({
                    "shares": stats.shares,
                    "hashrate": stats.hashrate(now),
                    "lastActiveMs": stats.last_active_ms,
                    "workers": stats.workers.len(),
                }),
            )
        })
        .collect();
    Json(rows.into())
}

async fn blocks_handler(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.account.records_snapshot().await))
}

async fn payouts_handler(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.store.recent_payouts().await))
}

async fn hashrate_history_handler(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.store.hashrate_history().await))
}

async fn version_handler() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle_block::{BlockAccountConfig, BlockFound};
    use crate::handle_rewards::{PayoutOutput, PayoutSender};
    use crate::node::Hash32;
    use crate::share_store::Contribution;
    use crate::test_util::{miner_address, pool_address, template_block, MockNode};
    use async_trait::async_trait;

    struct NoopPayout;

    #[async_trait]
    impl PayoutSender for NoopPayout {
        async fn send(&self, _outputs: &[PayoutOutput]) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    async fn state(tag: &str) -> ApiState {
        let dir = std::env::temp_dir().join(format!("kaspool-api-{}-{}", std::process::id(), tag));
        let _ = std::fs::remove_dir_all(&dir);
        let node = MockNode::with_templates(vec![template_block(1, 0x03000001)]);
        let store = PoolState::open(dir.join("state.json"), dir, false)
            .await
            .unwrap();
        let jobs = Arc::new(JobHandler::new(
            node.clone(),
            pool_address(),
            "kaspool-test".into(),
            8,
        ));
        let account = Arc::new(BlockAccount::new(
            node,
            store.clone(),
            Arc::new(NoopPayout),
            BlockAccountConfig {
                fee_percent: 0.0,
                operator_address: pool_address(),
                payment_threshold: u64::MAX,
                address_prefix: "kaspa".into(),
            },
        ));
        ApiState {
            ledger: Arc::new(ShareLedger::new(64)),
            account,
            store,
            jobs,
            broadcaster: Arc::new(Broadcaster::default()),
            address_prefix: "kaspa".into(),
            started_at_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn status_reports_counters_and_jobs() {
        let state = state("status").await;
        state.jobs.ingest().await.unwrap();
        let Json(body) = status_handler(State(state)).await;
        assert_eq!(body["jobs"], json!(1));
        assert_eq!(body["templates"], json!(1));
        assert_eq!(body["sharesAccepted"], json!(0));
        assert_eq!(body["blocksFound"], json!(0));
    }

    #[tokio::test]
    async fn miner_endpoint_validates_address() {
        let s = state("minerbad").await;
        let err = miner_handler(State(s), Query(HashMap::new()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn miner_endpoint_reports_balance_and_stats() {
        let s = state("miner").await;
        let address = miner_address("alfa");
        s.store.add_balance(&address, 777).await;
        s.ledger
            .record(
                Hash32([1u8; 32]),
                1,
                Contribution {
                    address: address.clone(),
                    worker: Some("rig0".into()),
                    difficulty_millis: 1000,
                    timestamp_ms: now_ms(),
                },
                false,
            )
            .await
            .unwrap();

        let mut q = HashMap::new();
        q.insert("address".to_string(), address.as_str().to_string());
        let Json(body) = miner_handler(State(s), Query(q)).await.unwrap();
        assert_eq!(body["balance"], json!(777));
        assert_eq!(body["shares"], json!(1));
        assert!(body["workers"]["rig0"]["hashrate"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn blocks_endpoint_serves_records() {
        let s = state("blocks").await;
        s.account
            .on_block_found(BlockFound {
                block_hash: Hash32([5u8; 32]),
                contributions: vec![Contribution {
                    address: miner_address("alfa"),
                    worker: None,
                    difficulty_millis: 1000,
                    timestamp_ms: 1,
                }],
            })
            .await;
        let Json(body) = blocks_handler(State(s)).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["status"], json!("submitted"));
        assert_eq!(body[0]["contributors"], json!(1));
    }
}
