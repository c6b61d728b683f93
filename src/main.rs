use std::{net::SocketAddr, sync::Arc};

use dotenvy::dotenv;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::node::{Address, NodeRpc};
use crate::pool::{Pool, PoolConfig};
use crate::poolstate::PoolState;

mod handle_block;
mod handle_rewards;
mod handle_share;
mod job_handler;
mod node;
mod pool;
mod pool_api_server;
mod poolstate;
mod pow;
mod share_store;
mod stratum_server;
#[cfg(test)]
mod test_util;

const EXIT_CONFIG: i32 = 1;
const EXIT_NODE_UNREACHABLE: i32 = 2;

fn default_stratum_bind() -> String {
    "0.0.0.0:5555".to_string()
}
fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_address_prefix() -> String {
    "kaspa".to_string()
}
fn default_identity() -> String {
    "kaspool".to_string()
}
fn default_pool_fee() -> f64 {
    1.0
}
fn default_payment_threshold() -> u64 {
    100_000_000 // 1 KAS
}
fn default_daa_window() -> usize {
    2_641
}
fn default_pplns_window() -> usize {
    100_000
}
fn default_initial_difficulty() -> f64 {
    1_024.0
}
fn default_state_file() -> String {
    "pool_state.json".to_string()
}
fn default_ledger_dir() -> String {
    ".".to_string()
}
fn default_ledger_enable() -> bool {
    true
}

#[derive(Deserialize)]
struct Config {
    /// Node RPC endpoint, host:port.
    node_addr: String,
    /// Pool treasury address templates pay to.
    pool_address: String,
    #[serde(default = "default_stratum_bind")]
    stratum_bind: String,
    #[serde(default = "default_api_bind")]
    api_bind: String,
    #[serde(default = "default_address_prefix")]
    address_prefix: String,
    /// Identity string stamped into coinbase extra-data.
    #[serde(default = "default_identity")]
    pool_identity: String,
    /// Pool fee in percent of the gross coinbase.
    #[serde(default = "default_pool_fee")]
    pool_fee: f64,
    /// Balances at or above this are paid out, in sompi.
    #[serde(default = "default_payment_threshold")]
    payment_threshold: u64,
    #[serde(default = "default_daa_window")]
    daa_window: usize,
    #[serde(default = "default_pplns_window")]
    pplns_window: usize,
    #[serde(default = "default_initial_difficulty")]
    initial_difficulty: f64,
    #[serde(default = "default_state_file")]
    state_file: String,
    #[serde(default = "default_ledger_dir")]
    ledger_dir: String,
    #[serde(default = "default_ledger_enable")]
    ledger_enable: bool,
}

fn config_exit(message: impl std::fmt::Display) -> ! {
    error!("configuration error: {message}");
    std::process::exit(EXIT_CONFIG);
}

#[tokio::main]
async fn main() {
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config: Config = match envy::from_env() {
        Ok(c) => c,
        Err(e) => config_exit(e),
    };

    let Some(pay_address) = Address::parse(&config.pool_address, &config.address_prefix) else {
        config_exit(format!("invalid pool address {:?}", config.pool_address));
    };
    let node_addr: SocketAddr = config
        .node_addr
        .parse()
        .unwrap_or_else(|e| config_exit(format!("node_addr: {e}")));
    let stratum_bind: SocketAddr = config
        .stratum_bind
        .parse()
        .unwrap_or_else(|e| config_exit(format!("stratum_bind: {e}")));
    let api_bind: SocketAddr = config
        .api_bind
        .parse()
        .unwrap_or_else(|e| config_exit(format!("api_bind: {e}")));
    if !(0.0..=100.0).contains(&config.pool_fee) {
        config_exit(format!("pool_fee {} out of range", config.pool_fee));
    }

    let node = match node::Client::connect(node_addr).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("node rpc unreachable at {node_addr}: {e}");
            std::process::exit(EXIT_NODE_UNREACHABLE);
        }
    };
    info!("connected to node at {node_addr}");

    let store = match PoolState::open(
        config.state_file.clone().into(),
        config.ledger_dir.clone().into(),
        config.ledger_enable,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => config_exit(format!("cannot open state file {}: {e}", config.state_file)),
    };

    let pool = Pool::new(
        node.clone() as Arc<dyn NodeRpc>,
        store,
        node.clone(),
        PoolConfig {
            operator_address: pay_address.clone(),
            pay_address,
            extra_data: config.pool_identity,
            address_prefix: config.address_prefix,
            fee_percent: config.pool_fee,
            payment_threshold: config.payment_threshold,
            daa_window: config.daa_window,
            pplns_window: config.pplns_window,
            initial_difficulty: config.initial_difficulty,
            stratum_bind,
            api_bind,
        },
    );

    info!(
        "kaspool {} starting: stratum {stratum_bind}, api {api_bind}, fee {}%",
        env!("CARGO_PKG_VERSION"),
        config.pool_fee
    );

    tokio::select! {
        result = pool.run() => {
            if let Err(e) = result {
                error!("pool stopped: {e}");
                std::process::exit(EXIT_CONFIG);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
}
