use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
    time::timeout,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node io: {0}")]
    Io(#[from] std::io::Error),
    #[error("node rpc: {0}")]
    Rpc(String),
    #[error("node request timed out")]
    Timeout,
    #[error("node connection closed")]
    ConnectionClosed,
    #[error("node wire format: {0}")]
    Wire(#[from] serde_json::Error),
}

// ── Hashes & addresses ──────────────────────────────────────────────────────

/// 32-byte hash carried on the wire as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let buf: [u8; 32] = raw.try_into().ok()?;
        Some(Self(buf))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 64 hex chars"))
    }
}

const ADDRESS_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Protocol-layer payment address, `prefix:payload` in bech32-style charset.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn parse(s: &str, expected_prefix: &str) -> Option<Self> {
        let (prefix, payload) = s.split_once(':')?;
        if prefix != expected_prefix {
            return None;
        }
        if payload.len() < 3 || payload.len() > 90 {
            return None;
        }
        if !payload.chars().all(|c| ADDRESS_CHARSET.contains(c)) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

// ── Block template wire types ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcBlockHeader {
    pub version: u16,
    pub parents: Vec<Hash32>,
    pub hash_merkle_root: Hash32,
    pub accepted_id_merkle_root: Hash32,
    pub utxo_commitment: Hash32,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
    pub daa_score: u64,
    pub blue_score: u64,
    pub pruning_point: Hash32,
}

/// A candidate block. Transactions are opaque to the pool; only the header
/// nonce is ever rewritten before resubmission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcBlock {
    pub header: RpcBlockHeader,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    IsInIBD,
    RouteIsFull,
    BlockInvalid(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::IsInIBD => f.write_str("IsInIBD"),
            RejectReason::RouteIsFull => f.write_str("RouteIsFull"),
            RejectReason::BlockInvalid(why) => write!(f, "BlockInvalid: {why}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "report", content = "reason")]
pub enum SubmitBlockReport {
    Success,
    Reject(RejectReason),
}

/// Events pushed by the node connection. `CoinbaseMaturity` originates in the
/// node-side UTXO processor and carries the gross coinbase for one of our
/// blocks once it has matured.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum NodeEvent {
    NewBlockTemplate,
    #[serde(rename_all = "camelCase")]
    CoinbaseMaturity {
        block_hash: Hash32,
        amount: u64,
        daa_score: u64,
    },
}

// ── The RPC surface the pool consumes ───────────────────────────────────────

#[async_trait]
pub trait NodeRpc: Send + Sync + 'static {
    async fn get_block_template(
        &self,
        pay_address: &Address,
        extra_data: &str,
    ) -> Result<RpcBlock, NodeError>;

    async fn submit_block(
        &self,
        block: RpcBlock,
        allow_non_daa_blocks: bool,
    ) -> Result<SubmitBlockReport, NodeError>;

    /// Whether the block ended up blue (part of the selected chain).
    async fn get_block_color(&self, hash: &Hash32) -> Result<bool, NodeError>;

    async fn get_fee_estimate(&self) -> Result<f64, NodeError>;

    fn events(&self) -> broadcast::Receiver<NodeEvent>;
}

// ── Line-JSON client ────────────────────────────────────────────────────────
//
// One TCP connection; requests are `{"id":N,"method":...,"params":...}` lines,
// responses echo the id, notifications carry a method and no id.

#[derive(Deserialize)]
struct WireMessage {
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

struct ClientInner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, NodeError>>>>,
    next_id: std::sync::atomic::AtomicU64,
    events: broadcast::Sender<NodeEvent>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, NodeError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(ClientInner {
            writer: Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
            events,
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader_inner.dispatch_line(&line).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(target: "node", "read failed: {e}");
                        break;
                    }
                }
            }
            // Fail anything still waiting so callers see the disconnect.
            let mut pending = reader_inner.pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(NodeError::ConnectionClosed));
            }
            tracing::warn!(target: "node", "connection closed");
        });

        Ok(Self { inner })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let id = self
            .inner
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&json!({"id": id, "method": method, "params": params}))?;
        {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }

        let outcome = match timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeError::ConnectionClosed),
            Err(_) => Err(NodeError::Timeout),
        };
        if outcome.is_err() {
            self.inner.pending.lock().await.remove(&id);
        }
        outcome
    }
}

impl ClientInner {
    async fn dispatch_line(&self, line: &str) {
        let msg: WireMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(target: "node", "unparseable line from node: {e}");
                return;
            }
        };

        match (msg.id, msg.method) {
            (Some(id), _) => {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let result = match msg.error {
                        Some(err) if !err.is_null() => Err(NodeError::Rpc(err.to_string())),
                        _ => Ok(msg.result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
            }
            (None, Some(_)) => {
                let raw = match msg.params {
                    Some(p) => p,
                    None => return,
                };
                match serde_json::from_value::<NodeEvent>(raw) {
                    Ok(event) => {
                        let _ = self.events.send(event);
                    }
                    Err(e) => tracing::warn!(target: "node", "unknown notification: {e}"),
                }
            }
            (None, None) => {}
        }
    }
}

#[async_trait]
impl NodeRpc for Client {
    async fn get_block_template(
        &self,
        pay_address: &Address,
        extra_data: &str,
    ) -> Result<RpcBlock, NodeError> {
        let result = self
            .request(
                "getBlockTemplate",
                json!({"payAddress": pay_address, "extraData": extra_data}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn submit_block(
        &self,
        block: RpcBlock,
        allow_non_daa_blocks: bool,
    ) -> Result<SubmitBlockReport, NodeError> {
        let result = self
            .request(
                "submitBlock",
                json!({"block": block, "allowNonDAABlocks": allow_non_daa_blocks}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_block_color(&self, hash: &Hash32) -> Result<bool, NodeError> {
        let result = self
            .request("getCurrentBlockColor", json!({"hash": hash}))
            .await?;
        let blue = result
            .get("blue")
            .and_then(Value::as_bool)
            .ok_or_else(|| NodeError::Rpc("missing blue flag".into()))?;
        Ok(blue)
    }

    async fn get_fee_estimate(&self) -> Result<f64, NodeError> {
        let result = self.request("getFeeEstimate", json!({})).await?;
        let estimate = result
            .get("estimate")
            .and_then(Value::as_f64)
            .ok_or_else(|| NodeError::Rpc("missing estimate".into()))?;
        Ok(estimate)
    }

    fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }
}

// The payout signer lives behind the same connection: one `send` request with
// the batch outputs, txids back.
#[async_trait]
impl crate::handle_rewards::PayoutSender for Client {
    async fn send(
        &self,
        outputs: &[crate::handle_rewards::PayoutOutput],
    ) -> anyhow::Result<Vec<String>> {
        let result = self.request("send", json!({"outputs": outputs})).await?;
        let txids = result
            .get("txids")
            .cloned()
            .ok_or_else(|| NodeError::Rpc("missing txids".into()))?;
        Ok(serde_json::from_value(txids).map_err(NodeError::from)?)
    }
}
