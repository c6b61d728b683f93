//! Shared fixtures for the in-module test suites.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::node::{
    Address, Hash32, NodeError, NodeEvent, NodeRpc, RpcBlock, RpcBlockHeader, SubmitBlockReport,
};

pub fn pool_address() -> Address {
    Address::parse("kaspa:qtreasury42", "kaspa").unwrap()
}

pub fn miner_address(tag: &str) -> Address {
    Address::parse(&format!("kaspa:q{tag}"), "kaspa")
        .unwrap_or_else(|| panic!("test address tag {tag:?} must use the bech32 charset"))
}

pub fn template_block(seed: u8, bits: u32) -> RpcBlock {
    RpcBlock {
        header: RpcBlockHeader {
            version: 1,
            parents: vec![Hash32([seed; 32])],
            hash_merkle_root: Hash32([seed.wrapping_add(1); 32]),
            accepted_id_merkle_root: Hash32([seed.wrapping_add(2); 32]),
            utxo_commitment: Hash32([seed.wrapping_add(3); 32]),
            timestamp: 1_700_000_000_000 + seed as u64,
            bits,
            nonce: 0,
            daa_score: 1_000 + seed as u64,
            blue_score: 900 + seed as u64,
            pruning_point: Hash32([0u8; 32]),
        },
        transactions: Vec::new(),
    }
}

/// Scripted stand-in for the node RPC seam.
pub struct MockNode {
    templates: Mutex<VecDeque<RpcBlock>>,
    submit_reports: Mutex<VecDeque<SubmitBlockReport>>,
    default_report: Mutex<SubmitBlockReport>,
    submitted: Mutex<Vec<RpcBlock>>,
    colors: Mutex<HashMap<Hash32, bool>>,
    events: broadcast::Sender<NodeEvent>,
}

impl MockNode {
    pub fn with_templates(templates: Vec<RpcBlock>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            templates: Mutex::new(templates.into()),
            submit_reports: Mutex::new(VecDeque::new()),
            default_report: Mutex::new(SubmitBlockReport::Success),
            submitted: Mutex::new(Vec::new()),
            colors: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn push_submit_report(&self, report: SubmitBlockReport) {
        self.submit_reports.lock().unwrap().push_back(report);
    }

    pub fn set_default_submit_report(&self, report: SubmitBlockReport) {
        *self.default_report.lock().unwrap() = report;
    }

    pub fn submitted_blocks(&self) -> Vec<RpcBlock> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn set_color(&self, hash: Hash32, blue: bool) {
        self.colors.lock().unwrap().insert(hash, blue);
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn get_block_template(
        &self,
        _pay_address: &Address,
        _extra_data: &str,
    ) -> Result<RpcBlock, NodeError> {
        self.templates
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| NodeError::Rpc("no template scripted".into()))
    }

    async fn submit_block(
        &self,
        block: RpcBlock,
        _allow_non_daa_blocks: bool,
    ) -> Result<SubmitBlockReport, NodeError> {
        self.submitted.lock().unwrap().push(block);
        let scripted = self.submit_reports.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.default_report.lock().unwrap().clone()))
    }

    async fn get_block_color(&self, hash: &Hash32) -> Result<bool, NodeError> {
        Ok(*self.colors.lock().unwrap().get(hash).unwrap_or(&true))
    }

    async fn get_fee_estimate(&self) -> Result<f64, NodeError> {
        Ok(1.0)
    }

    fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}
