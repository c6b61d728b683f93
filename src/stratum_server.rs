use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::handle_block::BlockFound;
use crate::handle_share::handle_share;
use crate::job_handler::{JobHandler, JobParams};
use crate::node::{Address, Hash32};
use crate::share_store::ShareLedger;

// ── Wire protocol ───────────────────────────────────────────────────────────

/// JSON-RPC id as miners actually send it: integer or string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RequestId {
    Int(u64),
    Str(String),
}

#[derive(Deserialize, Debug)]
pub struct RpcRequest {
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Debug)]
pub struct RpcResponse {
    pub id: RequestId,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl RpcResponse {
    pub fn ok(id: RequestId) -> Self {
        Self {
            id,
            result: Some(Value::Bool(true)),
            error: None,
        }
    }

    pub fn err(id: RequestId, error: &StratumError) -> Self {
        Self {
            id,
            result: None,
            error: Some(json!([error.code(), error.to_string(), Value::Null])),
        }
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Per-request errors answered on the wire; the session stays up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StratumError {
    #[error("job-not-found")]
    JobNotFound,
    #[error("duplicate-share")]
    DuplicateShare,
    #[error("low-difficulty-share")]
    LowDifficultyShare,
    #[error("unauthorized")]
    Unauthorized,
    #[error("internal-error")]
    InternalError,
}

impl StratumError {
    pub fn code(&self) -> i64 {
        match self {
            StratumError::JobNotFound => 20,
            StratumError::DuplicateShare => 21,
            StratumError::LowDifficultyShare => 22,
            StratumError::Unauthorized => 24,
            StratumError::InternalError => 25,
        }
    }
}

/// Notify payload shaping per miner family. The payload itself is the single
/// canonical `hash ‖ timestamp_le` hex string for every encoding; the hint is
/// kept per session so firmware-specific variants stay one switch away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    #[default]
    BigHeader,
    Bitmain,
}

const BITMAIN_AGENT_HINTS: &[&str] = &["bitmain", "antminer", "godminer"];

pub fn detect_encoding(agent: &str) -> PayloadEncoding {
    let agent = agent.to_ascii_lowercase();
    if BITMAIN_AGENT_HINTS.iter().any(|hint| agent.contains(hint)) {
        PayloadEncoding::Bitmain
    } else {
        PayloadEncoding::BigHeader
    }
}

pub fn notify_payload(hash: &Hash32, timestamp: u64, encoding: PayloadEncoding) -> String {
    match encoding {
        PayloadEncoding::BigHeader | PayloadEncoding::Bitmain => {
            format!("{}{}", hash.to_hex(), hex::encode(timestamp.to_le_bytes()))
        }
    }
}

fn notification(method: &str, params: Value) -> String {
    serde_json::to_string(&json!({"method": method, "params": params}))
        .unwrap_or_else(|_| "{}".to_string())
}

// ── Broadcaster ─────────────────────────────────────────────────────────────

struct SessionEntry {
    tx: mpsc::UnboundedSender<String>,
    encoding: PayloadEncoding,
    authorized: bool,
    addresses: HashSet<Address>,
}

#[derive(Default)]
struct BroadcasterInner {
    sessions: HashMap<u64, SessionEntry>,
    by_address: HashMap<Address, HashSet<u64>>,
}

/// Job fan-out to all live authorized sessions, plus the address → sessions
/// map. Dead sockets are pruned from both on the next send that fails.
#[derive(Default)]
pub struct Broadcaster {
    inner: Mutex<BroadcasterInner>,
}

impl Broadcaster {
    pub async fn register(
        &self,
        session_id: u64,
        tx: mpsc::UnboundedSender<String>,
        encoding: PayloadEncoding,
    ) {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(
            session_id,
            SessionEntry {
                tx,
                encoding,
                authorized: false,
                addresses: HashSet::new(),
            },
        );
    }

    pub async fn authorize(&self, session_id: u64, address: Address) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.sessions.get_mut(&session_id) {
            entry.authorized = true;
            entry.addresses.insert(address.clone());
        }
        inner.by_address.entry(address).or_default().insert(session_id);
    }

    pub async fn remove(&self, session_id: u64) {
        let mut inner = self.inner.lock().await;
        Self::remove_locked(&mut inner, session_id);
    }

    fn remove_locked(inner: &mut BroadcasterInner, session_id: u64) {
        if let Some(entry) = inner.sessions.remove(&session_id) {
            for address in entry.addresses {
                if let Some(set) = inner.by_address.get_mut(&address) {
                    set.remove(&session_id);
                    if set.is_empty() {
                        inner.by_address.remove(&address);
                    }
                }
            }
        }
    }

    pub async fn notify_job(&self, job: &JobParams) {
        let mut inner = self.inner.lock().await;
        let mut dead = Vec::new();
        for (id, entry) in inner.sessions.iter() {
            if !entry.authorized {
                continue;
            }
            let payload = notify_payload(&job.pre_pow_hash, job.timestamp, entry.encoding);
            let line = notification("mining.notify", json!([job.job_id, payload]));
            if entry.tx.send(line).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!(target: "stratum", "pruning dead session {id}");
            Self::remove_locked(&mut inner, id);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn authorized_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.authorized)
            .count()
    }

    pub async fn address_count(&self) -> usize {
        self.inner.lock().await.by_address.len()
    }

    pub async fn sessions_for(&self, address: &Address) -> usize {
        self.inner
            .lock()
            .await
            .by_address
            .get(address)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

// ── Session state ───────────────────────────────────────────────────────────

struct Session {
    id: u64,
    agent: Option<String>,
    encoding: PayloadEncoding,
    subscribed: bool,
    authorized: bool,
    workers: HashSet<(Address, Option<String>)>,
    difficulty: f64,
    extranonce: Option<[u8; 4]>,
}

impl Session {
    fn new(id: u64, difficulty: f64) -> Self {
        Self {
            id,
            agent: None,
            encoding: PayloadEncoding::default(),
            subscribed: false,
            authorized: false,
            workers: HashSet::new(),
            difficulty,
            extranonce: None,
        }
    }
}

/// Split a `address.workerName` login identity.
fn split_identity(identity: &str, prefix: &str) -> Option<(Address, Option<String>)> {
    let (address_part, worker) = match identity.split_once('.') {
        Some((a, w)) if !w.is_empty() => (a, Some(w.to_string())),
        Some((a, _)) => (a, None),
        None => (identity, None),
    };
    Address::parse(address_part, prefix).map(|a| (a, worker))
}

// ── Server ──────────────────────────────────────────────────────────────────

pub struct StratumConfig {
    pub bind: SocketAddr,
    pub initial_difficulty: f64,
    pub address_prefix: String,
}

pub struct StratumServer {
    jobs: Arc<JobHandler>,
    ledger: Arc<ShareLedger>,
    pub broadcaster: Arc<Broadcaster>,
    blocks_found: mpsc::UnboundedSender<BlockFound>,
    config: StratumConfig,
    next_session_id: AtomicU64,
}

impl StratumServer {
    pub fn new(
        jobs: Arc<JobHandler>,
        ledger: Arc<ShareLedger>,
        blocks_found: mpsc::UnboundedSender<BlockFound>,
        config: StratumConfig,
    ) -> Self {
        Self {
            jobs,
            ledger,
            broadcaster: Arc::new(Broadcaster::default()),
            blocks_found,
            config,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Bind and accept forever. Bind failure is fatal and returned to main.
    pub async fn listen(self: Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(self.config.bind).await?;
        info!(target: "stratum", "listening on {}", listener.local_addr()?);

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer.to_string()).await;
                        });
                    }
                    Err(e) => {
                        warn!(target: "stratum", "accept failed: {e}");
                    }
                }
            }
        }))
    }

    /// One miner connection: a writer task drains the outbound queue (so
    /// responses and notifications share one FIFO), the reader loop handles
    /// requests strictly in arrival order.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!(target: "stratum", "session {session_id} opened from {peer}");

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut session = Session::new(session_id, self.config.initial_difficulty);
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let request: RpcRequest = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(target: "stratum", "session {session_id} sent malformed json: {e}");
                    break;
                }
            };
            if !self.handle_request(&mut session, &tx, request).await {
                break;
            }
        }

        self.broadcaster.remove(session_id).await;
        drop(tx);
        let _ = writer.await;
        debug!(
            target: "stratum",
            "session {session_id} closed ({peer}, agent {:?})",
            session.agent.as_deref().unwrap_or("-")
        );
    }

    /// Returns false when the session must be torn down.
    async fn handle_request(
        &self,
        session: &mut Session,
        tx: &mpsc::UnboundedSender<String>,
        request: RpcRequest,
    ) -> bool {
        let id = match request.id {
            Some(id) => id,
            None => {
                warn!(target: "stratum", "session {} sent request without id", session.id);
                return false;
            }
        };

        let outcome = match request.method.as_str() {
            "mining.subscribe" => self.on_subscribe(session, tx, &request.params).await,
            "mining.authorize" => self.on_authorize(session, &request.params).await,
            "mining.submit" => self.on_submit(session, &request.params).await.map(|_| Vec::new()),
            other => {
                warn!(target: "stratum", "session {} called unknown method {other}", session.id);
                return false;
            }
        };

        // The ack goes out first, then whatever the handler wants pushed
        // (extranonce, difficulty) rides the same queue behind it.
        match outcome {
            Ok(follow_ups) => {
                if tx.send(RpcResponse::ok(id).to_line()).is_err() {
                    return false;
                }
                for line in follow_ups {
                    if tx.send(line).is_err() {
                        return false;
                    }
                }
                true
            }
            Err(e) => tx.send(RpcResponse::err(id, &e).to_line()).is_ok(),
        }
    }

    async fn on_subscribe(
        &self,
        session: &mut Session,
        tx: &mpsc::UnboundedSender<String>,
        params: &Value,
    ) -> Result<Vec<String>, StratumError> {
        let agent = params
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        session.encoding = detect_encoding(&agent);
        debug!(
            target: "stratum",
            "session {} subscribed, agent {agent:?}, encoding {:?}", session.id, session.encoding
        );
        session.agent = Some(agent);
        session.subscribed = true;
        self.broadcaster
            .register(session.id, tx.clone(), session.encoding)
            .await;
        Ok(Vec::new())
    }

    async fn on_authorize(
        &self,
        session: &mut Session,
        params: &Value,
    ) -> Result<Vec<String>, StratumError> {
        if !session.subscribed {
            return Err(StratumError::Unauthorized);
        }
        let identity = params
            .get(0)
            .and_then(Value::as_str)
            .ok_or(StratumError::Unauthorized)?;
        let (address, worker) = split_identity(identity, &self.config.address_prefix)
            .ok_or(StratumError::Unauthorized)?;

        session.workers.insert((address.clone(), worker));
        session.authorized = true;
        self.broadcaster.authorize(session.id, address.clone()).await;
        info!(target: "stratum", "session {} authorized for {address}", session.id);

        // extranonce is handed out exactly once per session
        let mut follow_ups = Vec::new();
        if session.extranonce.is_none() {
            let extranonce: [u8; 4] = rand::thread_rng().gen();
            session.extranonce = Some(extranonce);
            follow_ups.push(notification(
                "set_extranonce",
                json!([hex::encode(extranonce)]),
            ));
            follow_ups.push(notification(
                "mining.set_difficulty",
                json!([session.difficulty]),
            ));
        }
        Ok(follow_ups)
    }

    async fn on_submit(&self, session: &mut Session, params: &Value) -> Result<(), StratumError> {
        if !session.authorized {
            return Err(StratumError::Unauthorized);
        }
        let identity = params
            .get(0)
            .and_then(Value::as_str)
            .ok_or(StratumError::Unauthorized)?;
        let job_id = params
            .get(1)
            .and_then(Value::as_str)
            .ok_or(StratumError::JobNotFound)?;
        let nonce_hex = params
            .get(2)
            .and_then(Value::as_str)
            .ok_or(StratumError::InternalError)?;

        let (address, worker) = split_identity(identity, &self.config.address_prefix)
            .ok_or(StratumError::Unauthorized)?;
        if !session.workers.iter().any(|(a, _)| *a == address) {
            return Err(StratumError::Unauthorized);
        }

        let outcome = handle_share(
            &self.jobs,
            &self.ledger,
            &self.blocks_found,
            address,
            worker,
            session.difficulty,
            job_id,
            nonce_hex,
        )
        .await?;

        if outcome.is_block {
            if let Some(block_hash) = outcome.block_hash {
                info!(target: "stratum", "session {} found block {block_hash}", session.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader as TokioBufReader, DuplexStream};

    use crate::test_util::{template_block, MockNode};

    fn response_line(value: &Value) -> (Option<u64>, bool, Option<i64>) {
        let id = value.get("id").and_then(Value::as_u64);
        let ok = value.get("result") == Some(&Value::Bool(true));
        let code = value
            .get("error")
            .and_then(|e| e.get(0))
            .and_then(Value::as_i64);
        (id, ok, code)
    }

    #[test]
    fn error_codes_match_protocol() {
        assert_eq!(StratumError::JobNotFound.code(), 20);
        assert_eq!(StratumError::DuplicateShare.code(), 21);
        assert_eq!(StratumError::LowDifficultyShare.code(), 22);
        assert_eq!(StratumError::Unauthorized.code(), 24);
        assert_eq!(StratumError::InternalError.code(), 25);
    }

    #[test]
    fn response_wire_shape() {
        let ok = RpcResponse::ok(RequestId::Int(3)).to_line();
        assert_eq!(ok, r#"{"id":3,"result":true,"error":null}"#);

        let err = RpcResponse::err(RequestId::Int(4), &StratumError::DuplicateShare).to_line();
        assert_eq!(err, r#"{"id":4,"result":null,"error":[21,"duplicate-share",null]}"#);
    }

    #[test]
    fn request_id_accepts_both_shapes() {
        let r: RpcRequest =
            serde_json::from_str(r#"{"id":"a","method":"mining.subscribe","params":[]}"#).unwrap();
        assert_eq!(r.id, Some(RequestId::Str("a".into())));
        let r: RpcRequest =
            serde_json::from_str(r#"{"id":7,"method":"mining.subscribe"}"#).unwrap();
        assert_eq!(r.id, Some(RequestId::Int(7)));
    }

    #[test]
    fn encoding_detection_is_substring_based() {
        assert_eq!(detect_encoding("test/1.0"), PayloadEncoding::BigHeader);
        assert_eq!(detect_encoding("BitMain S19"), PayloadEncoding::Bitmain);
        assert_eq!(detect_encoding("GodMiner/2.0"), PayloadEncoding::Bitmain);
        assert_eq!(detect_encoding("ANTMINER ks3"), PayloadEncoding::Bitmain);
    }

    #[test]
    fn notify_payload_is_hash_then_le_timestamp() {
        let hash = Hash32([0x11; 32]);
        let payload = notify_payload(&hash, 0x0102030405060708, PayloadEncoding::BigHeader);
        assert_eq!(payload.len(), 64 + 16);
        assert!(payload.starts_with(&"11".repeat(32)));
        assert!(payload.ends_with("0807060504030201"));
        // encodings share the canonical shape
        assert_eq!(
            payload,
            notify_payload(&hash, 0x0102030405060708, PayloadEncoding::Bitmain)
        );
    }

    #[test]
    fn identity_splits_address_and_worker() {
        let (a, w) = split_identity("kaspa:qrx.worker1", "kaspa").unwrap();
        assert_eq!(a.as_str(), "kaspa:qrx");
        assert_eq!(w.as_deref(), Some("worker1"));

        let (a, w) = split_identity("kaspa:qrx", "kaspa").unwrap();
        assert_eq!(a.as_str(), "kaspa:qrx");
        assert_eq!(w, None);

        assert!(split_identity("bogus", "kaspa").is_none());
    }

    // ── session-level tests over an in-memory stream ───────────────────────

    struct Harness {
        server: Arc<StratumServer>,
        client: TokioBufReader<tokio::io::ReadHalf<DuplexStream>>,
        client_tx: tokio::io::WriteHalf<DuplexStream>,
        job: JobParams,
        block_rx: mpsc::UnboundedReceiver<BlockFound>,
    }

    impl Harness {
        async fn send(&mut self, line: &str) {
            use tokio::io::AsyncWriteExt;
            self.client_tx.write_all(line.as_bytes()).await.unwrap();
            self.client_tx.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            self.client.read_line(&mut line).await.unwrap();
            serde_json::from_str(line.trim()).unwrap()
        }
    }

    async fn harness(bits: u32) -> Harness {
        let node = MockNode::with_templates(vec![template_block(1, bits)]);
        let jobs = Arc::new(JobHandler::new(
            node,
            crate::test_util::pool_address(),
            "kaspool-test".into(),
            8,
        ));
        let job = jobs.ingest().await.unwrap().unwrap();

        let (block_tx, block_rx) = mpsc::unbounded_channel();
        let server = Arc::new(StratumServer::new(
            jobs,
            Arc::new(ShareLedger::new(1024)),
            block_tx,
            StratumConfig {
                bind: "127.0.0.1:0".parse().unwrap(),
                initial_difficulty: 1.0,
                address_prefix: "kaspa".into(),
            },
        ));

        let (server_side, client_side) = duplex(16 * 1024);
        tokio::spawn(
            server
                .clone()
                .handle_connection(server_side, "test".into()),
        );
        let (client_read, client_tx) = tokio::io::split(client_side);

        Harness {
            server,
            client: TokioBufReader::new(client_read),
            client_tx,
            job,
            block_rx,
        }
    }

    #[tokio::test]
    async fn subscribe_authorize_notify_flow() {
        let mut h = harness(0x03000001).await;

        h.send(r#"{"id":1,"method":"mining.subscribe","params":["test/1.0"]}"#)
            .await;
        let (id, ok, _) = response_line(&h.recv().await);
        assert_eq!((id, ok), (Some(1), true));

        h.send(r#"{"id":2,"method":"mining.authorize","params":["kaspa:qrx.worker1"]}"#)
            .await;
        let (id, ok, _) = response_line(&h.recv().await);
        assert_eq!((id, ok), (Some(2), true));

        // set_extranonce with 8 hex chars, then the session difficulty
        let extranonce = h.recv().await;
        assert_eq!(extranonce["method"], "set_extranonce");
        let hex4 = extranonce["params"][0].as_str().unwrap();
        assert_eq!(hex4.len(), 8);
        assert!(hex4.chars().all(|c| c.is_ascii_hexdigit()));

        let difficulty = h.recv().await;
        assert_eq!(difficulty["method"], "mining.set_difficulty");
        assert_eq!(difficulty["params"][0], json!(1.0));

        // a fresh job reaches the authorized session
        let job = h.job.clone();
        h.server.broadcaster.notify_job(&job).await;
        let notify = h.recv().await;
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"][0].as_str().unwrap(), job.job_id);
        assert_eq!(notify["params"][1].as_str().unwrap().len(), 80);
    }

    #[tokio::test]
    async fn duplicate_share_gets_code_21() {
        let mut h = harness(0x03000001).await;

        h.send(r#"{"id":1,"method":"mining.subscribe","params":["test/1.0"]}"#)
            .await;
        h.recv().await;
        h.send(r#"{"id":2,"method":"mining.authorize","params":["kaspa:qrx.worker1"]}"#)
            .await;
        h.recv().await; // result
        h.recv().await; // extranonce
        h.recv().await; // difficulty

        let submit = format!(
            r#"{{"id":3,"method":"mining.submit","params":["kaspa:qrx.worker1","{}","0000000000000001"]}}"#,
            h.job.job_id
        );
        h.send(&submit).await;
        let (id, ok, code) = response_line(&h.recv().await);
        assert_eq!((id, ok, code), (Some(3), true, None));

        let submit = format!(
            r#"{{"id":4,"method":"mining.submit","params":["kaspa:qrx.worker1","{}","0000000000000001"]}}"#,
            h.job.job_id
        );
        h.send(&submit).await;
        let (id, ok, code) = response_line(&h.recv().await);
        assert_eq!((id, ok, code), (Some(4), false, Some(21)));
    }

    #[tokio::test]
    async fn submit_before_authorize_is_code_24() {
        let mut h = harness(0x03000001).await;
        h.send(r#"{"id":1,"method":"mining.subscribe","params":["test/1.0"]}"#)
            .await;
        h.recv().await;

        let submit = format!(
            r#"{{"id":2,"method":"mining.submit","params":["kaspa:qrx","{}","01"]}}"#,
            h.job.job_id
        );
        h.send(&submit).await;
        let (_, ok, code) = response_line(&h.recv().await);
        assert_eq!((ok, code), (false, Some(24)));
    }

    #[tokio::test]
    async fn bad_address_cannot_authorize() {
        let mut h = harness(0x03000001).await;
        h.send(r#"{"id":1,"method":"mining.subscribe","params":["test/1.0"]}"#)
            .await;
        h.recv().await;

        h.send(r#"{"id":2,"method":"mining.authorize","params":["bitcoin:1abc.w"]}"#)
            .await;
        let (_, ok, code) = response_line(&h.recv().await);
        assert_eq!((ok, code), (false, Some(24)));
    }

    #[tokio::test]
    async fn unknown_job_is_code_20_and_block_hit_flows_through() {
        let mut h = harness(0x20ffffff).await;
        h.send(r#"{"id":1,"method":"mining.subscribe","params":["test/1.0"]}"#)
            .await;
        h.recv().await;
        h.send(r#"{"id":2,"method":"mining.authorize","params":["kaspa:qrx.worker1"]}"#)
            .await;
        h.recv().await;
        h.recv().await;
        h.recv().await;

        h.send(r#"{"id":3,"method":"mining.submit","params":["kaspa:qrx.worker1","ffffffff","01"]}"#)
            .await;
        let (_, _, code) = response_line(&h.recv().await);
        assert_eq!(code, Some(20));

        // with solve-everything bits, any nonce against the real job is a block
        let submit = format!(
            r#"{{"id":4,"method":"mining.submit","params":["kaspa:qrx.worker1","{}","02"]}}"#,
            h.job.job_id
        );
        h.send(&submit).await;
        let (_, ok, _) = response_line(&h.recv().await);
        assert!(ok);

        let found = h.block_rx.recv().await.unwrap();
        assert_eq!(found.contributions.len(), 1);
        assert_eq!(found.contributions[0].address.as_str(), "kaspa:qrx");
    }

    #[tokio::test]
    async fn malformed_json_closes_the_session() {
        let mut h = harness(0x03000001).await;
        h.send(r#"{"id":1,"method":"mining.subscribe","params":["test/1.0"]}"#)
            .await;
        h.recv().await;
        assert_eq!(h.server.broadcaster.session_count().await, 1);

        h.send("this is not json").await;

        // the server tears the connection down; EOF on our read side
        let mut line = String::new();
        let n = h.client.read_line(&mut line).await.unwrap();
        assert_eq!(n, 0);

        // and the broadcaster forgets the session
        for _ in 0..50 {
            if h.server.broadcaster.session_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(h.server.broadcaster.session_count().await, 0);
    }

    #[tokio::test]
    async fn dead_sessions_are_pruned_on_fanout() {
        let broadcaster = Broadcaster::default();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();

        broadcaster.register(1, tx_live, PayloadEncoding::BigHeader).await;
        broadcaster.register(2, tx_dead, PayloadEncoding::BigHeader).await;
        let address = crate::test_util::miner_address("alfa");
        broadcaster.authorize(1, address.clone()).await;
        broadcaster.authorize(2, address.clone()).await;
        assert_eq!(broadcaster.sessions_for(&address).await, 2);

        drop(rx_dead);
        let job = JobParams {
            job_id: "0a0b0c0d".into(),
            pre_pow_hash: Hash32([1u8; 32]),
            timestamp: 7,
        };
        broadcaster.notify_job(&job).await;

        assert!(rx_live.recv().await.is_some());
        assert_eq!(broadcaster.session_count().await, 1);
        assert_eq!(broadcaster.sessions_for(&address).await, 1);

        // last session for the address gone -> address entry gone
        broadcaster.remove(1).await;
        assert_eq!(broadcaster.address_count().await, 0);
    }
}
