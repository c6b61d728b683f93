use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handle_block::BlockFound;
use crate::job_handler::{JobHandler, SubmitError};
use crate::node::Address;
use crate::pow::{calculate_target, difficulty_millis};
use crate::share_store::{Contribution, ShareLedger};
use crate::stratum_server::StratumError;

#[derive(Debug)]
pub struct ShareOutcome {
    pub is_block: bool,
    pub block_hash: Option<crate::node::Hash32>,
}

/// Validate and account one `mining.submit`. Share-level failures come back
/// as the wire error to answer with; the session itself stays up.
pub async fn handle_share(
    jobs: &JobHandler,
    ledger: &ShareLedger,
    blocks_found: &mpsc::UnboundedSender<BlockFound>,
    address: Address,
    worker: Option<String>,
    difficulty: f64,
    job_id: &str,
    nonce_hex: &str,
) -> Result<ShareOutcome, StratumError> {
    let template = match jobs.lookup_job(job_id).await {
        Some(h) => h,
        None => {
            ledger.note_rejected().await;
            return Err(StratumError::JobNotFound);
        }
    };
    let pow = match jobs.template_pow(&template).await {
        Some(p) => p,
        None => {
            // evicted between registry lookup and cache read
            ledger.note_rejected().await;
            return Err(StratumError::JobNotFound);
        }
    };

    let nonce = match parse_nonce(nonce_hex) {
        Some(n) => n,
        None => {
            ledger.note_rejected().await;
            return Err(StratumError::InternalError);
        }
    };

    if ledger.is_duplicate(&template, nonce).await {
        ledger.note_rejected().await;
        return Err(StratumError::DuplicateShare);
    }

    let (is_block, value) = pow.check_work(nonce);
    if value > calculate_target(difficulty) {
        ledger.note_rejected().await;
        return Err(StratumError::LowDifficultyShare);
    }

    let contribution = Contribution {
        address: address.clone(),
        worker,
        difficulty_millis: difficulty_millis(difficulty),
        timestamp_ms: now_ms(),
    };

    // The window snapshot for a block hit is copied in the same write section
    // that admits the winning share, so it holds everything up to and
    // including this share and nothing admitted afterwards.
    let snapshot = match ledger.record(template, nonce, contribution, is_block).await {
        Some(s) => s,
        None => {
            ledger.note_rejected().await;
            return Err(StratumError::DuplicateShare);
        }
    };

    debug!(target: "shares", %address, job_id, nonce, "share accepted");

    if !is_block {
        return Ok(ShareOutcome {
            is_block: false,
            block_hash: None,
        });
    }

    info!(target: "shares", %address, job_id, nonce, "share solves the block, submitting");
    match jobs.submit(template, nonce).await {
        Ok(block_hash) => {
            let _ = blocks_found.send(BlockFound {
                block_hash,
                contributions: snapshot,
            });
            Ok(ShareOutcome {
                is_block: true,
                block_hash: Some(block_hash),
            })
        }
        Err(SubmitError::BlockInvalid(why)) => {
            // Fatal for this submission only; the share is already recorded
            // and the template stays until normal eviction.
            warn!(target: "shares", %address, job_id, "node ruled block invalid: {why}");
            Ok(ShareOutcome {
                is_block: true,
                block_hash: None,
            })
        }
        Err(e) => {
            warn!(target: "shares", %address, job_id, "block submission failed: {e}");
            Ok(ShareOutcome {
                is_block: true,
                block_hash: None,
            })
        }
    }
}

fn parse_nonce(nonce_hex: &str) -> Option<u64> {
    let trimmed = nonce_hex.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).ok()
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
