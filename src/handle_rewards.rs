use std::collections::BTreeMap;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::node::Address;
use crate::share_store::Contribution;

/// One entry of a payout batch, in sompi.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutOutput {
    pub address: Address,
    pub amount: u64,
}

/// The external transaction builder/signer: one entry point, outputs in,
/// txids out.
#[async_trait]
pub trait PayoutSender: Send + Sync + 'static {
    async fn send(&self, outputs: &[PayoutOutput]) -> anyhow::Result<Vec<String>>;
}

/// Pool fee in parts-per-million fixed point, so the carve is exact.
pub fn carve_fee(gross: u64, fee_percent: f64) -> (u64, u64) {
    let percent = if fee_percent.is_finite() {
        fee_percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let fee_ppm = (percent * 10_000.0).round() as u128;
    let fee = ((gross as u128) * fee_ppm / 1_000_000) as u64;
    (fee, gross - fee)
}

/// Proportional split of `amount` over the snapshot, weighted by share
/// difficulty: `reward = ⌊amount · weight / total_weight⌋`, multiply first,
/// divide last. Rounding dust stays with the treasury; it is strictly less
/// than the number of distinct contributors in sompi.
pub fn split_rewards(contributions: &[Contribution], amount: u64) -> Vec<PayoutOutput> {
    if amount == 0 || contributions.is_empty() {
        return Vec::new();
    }

    // Aggregate weight per address; BTreeMap keeps the output deterministic.
    let mut weights: BTreeMap<Address, BigUint> = BTreeMap::new();
    let mut total = BigUint::from(0u32);
    for c in contributions {
        let w = BigUint::from(c.difficulty_millis.max(1));
        *weights.entry(c.address.clone()).or_default() += &w;
        total += w;
    }

    let amount_big = BigUint::from(amount);
    weights
        .into_iter()
        .filter_map(|(address, weight)| {
            let reward = (&amount_big * weight) / &total;
            let reward = reward.to_u64_digits();
            let amount = match reward.as_slice() {
                [] => 0,
                [lo] => *lo,
                _ => u64::MAX, // unreachable: reward <= amount
            };
            (amount > 0).then_some(PayoutOutput { address, amount })
        })
        .collect()
}
