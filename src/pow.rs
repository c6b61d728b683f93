use num_bigint::BigUint;

use crate::node::{Hash32, RpcBlockHeader};

/// Fixed-point scale for fractional share difficulties.
pub const DIFF_SCALE: u64 = 1_000;

fn max_target() -> BigUint {
    BigUint::from_bytes_be(&[0xFFu8; 32])
}

/// Decode a compact-form difficulty target (`bits` header field).
pub fn target_from_bits(bits: u32) -> BigUint {
    let exponent = (bits >> 24) as u32;
    let mantissa = BigUint::from(bits & 0x00ff_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// Share target for an advertised difficulty: `MAX_TARGET / difficulty`.
/// A share is strong enough when its PoW value does not exceed this.
pub fn calculate_target(difficulty: f64) -> BigUint {
    let millis = difficulty_millis(difficulty);
    (max_target() * DIFF_SCALE) / BigUint::from(millis)
}

/// Advertised difficulty in integer milli-units; contributions carry this so
/// reward splits stay in exact integer arithmetic.
pub fn difficulty_millis(difficulty: f64) -> u64 {
    let clamped = if difficulty.is_finite() && difficulty > 0.0 {
        difficulty
    } else {
        1.0
    };
    ((clamped * DIFF_SCALE as f64).round() as u64).max(1)
}

/// Network difficulty of a target, for reporting only.
pub fn target_to_difficulty(target: &BigUint) -> f64 {
    if target == &BigUint::from(0u32) {
        return 0.0;
    }
    let ratio = (max_target() * DIFF_SCALE) / target.clone();
    biguint_to_f64(&ratio) / DIFF_SCALE as f64
}

fn biguint_to_f64(v: &BigUint) -> f64 {
    let bytes = v.to_bytes_be();
    if bytes.len() <= 8 {
        let mut buf = [0u8; 8];
        buf[8 - bytes.len()..].copy_from_slice(&bytes);
        u64::from_be_bytes(buf) as f64
    } else {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        u64::from_be_bytes(buf) as f64 * 2f64.powi(8 * (bytes.len() as i32 - 8))
    }
}

/// Per-template proof-of-work state: the header hash with the nonce excluded,
/// plus the decoded network target. The hash primitive is delegated to blake3.
#[derive(Clone, Debug)]
pub struct PowState {
    pre_pow_hash: Hash32,
    timestamp: u64,
    network_target: BigUint,
}

impl PowState {
    pub fn new(header: &RpcBlockHeader) -> Self {
        Self {
            pre_pow_hash: hash_header(header, true),
            timestamp: header.timestamp,
            network_target: target_from_bits(header.bits),
        }
    }

    pub fn pre_pow_hash(&self) -> Hash32 {
        self.pre_pow_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn network_target(&self) -> &BigUint {
        &self.network_target
    }

    /// Evaluate one nonce. Returns whether it solves the block outright and
    /// the PoW value itself (lower value = stronger work).
    pub fn check_work(&self, nonce: u64) -> (bool, BigUint) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.pre_pow_hash.as_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&[0u8; 32]);
        hasher.update(&nonce.to_le_bytes());
        let value = BigUint::from_bytes_be(hasher.finalize().as_bytes());
        (value <= self.network_target, value)
    }
}

/// Hash a header. With `exclude_pow` the nonce and timestamp are zeroed,
/// yielding the pre-PoW hash miners grind against; without it this is the
/// finalized block hash.
pub fn hash_header(header: &RpcBlockHeader, exclude_pow: bool) -> Hash32 {
    let (timestamp, nonce) = if exclude_pow {
        (0u64, 0u64)
    } else {
        (header.timestamp, header.nonce)
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(&header.version.to_le_bytes());
    hasher.update(&(header.parents.len() as u64).to_le_bytes());
    for parent in &header.parents {
        hasher.update(parent.as_bytes());
    }
    hasher.update(header.hash_merkle_root.as_bytes());
    hasher.update(header.accepted_id_merkle_root.as_bytes());
    hasher.update(header.utxo_commitment.as_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&header.bits.to_le_bytes());
    hasher.update(&nonce.to_le_bytes());
    hasher.update(&header.daa_score.to_le_bytes());
    hasher.update(&header.blue_score.to_le_bytes());
    hasher.update(header.pruning_point.as_bytes());
    Hash32(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_header(bits: u32) -> RpcBlockHeader {
        RpcBlockHeader {
            version: 1,
            parents: vec![Hash32([1u8; 32])],
            hash_merkle_root: Hash32([2u8; 32]),
            accepted_id_merkle_root: Hash32([3u8; 32]),
            utxo_commitment: Hash32([4u8; 32]),
            timestamp: 1_700_000_000_123,
            bits,
            nonce: 0,
            daa_score: 98_765,
            blue_score: 43_210,
            pruning_point: Hash32([5u8; 32]),
        }
    }

    #[test]
    fn bits_decode_known_value() {
        // mantissa 0x00ffff shifted by 26 bytes
        let target = target_from_bits(0x1d00ffff);
        let expected = BigUint::from(0x00ffffu32) << (8 * 26);
        assert_eq!(target, expected);
    }

    #[test]
    fn bits_decode_small_exponent() {
        let target = target_from_bits(0x01_00_00_10);
        assert_eq!(target, BigUint::from(0u32));
        let target = target_from_bits(0x03_00_00_10);
        assert_eq!(target, BigUint::from(0x10u32));
    }

    #[test]
    fn harder_difficulty_means_smaller_target() {
        let t1 = calculate_target(1.0);
        let t1000 = calculate_target(1000.0);
        let t_half = calculate_target(0.5);
        assert!(t1000 < t1);
        assert!(t1 < t_half);
    }

    #[test]
    fn difficulty_millis_handles_edges() {
        assert_eq!(difficulty_millis(1.0), 1_000);
        assert_eq!(difficulty_millis(0.5), 500);
        assert_eq!(difficulty_millis(0.0), 1);
        assert_eq!(difficulty_millis(f64::NAN), 1);
    }

    #[test]
    fn target_difficulty_round_trip_is_close() {
        let target = calculate_target(1000.0);
        let diff = target_to_difficulty(&target);
        assert!((diff - 1000.0).abs() / 1000.0 < 0.01, "got {diff}");
    }

    #[test]
    fn pre_pow_hash_ignores_nonce_and_timestamp() {
        let mut header = test_header(0x207fffff);
        let pow_a = PowState::new(&header);
        header.nonce = 42;
        header.timestamp += 5;
        // timestamp participates in check_work but not in the pre-PoW hash
        assert_eq!(pow_a.pre_pow_hash(), hash_header(&header, true));
    }

    #[test]
    fn check_work_is_deterministic_and_bounded() {
        let header = test_header(0x207fffff);
        let pow = PowState::new(&header);
        let (_, v1) = pow.check_work(7);
        let (_, v2) = pow.check_work(7);
        assert_eq!(v1, v2);
        let (_, v3) = pow.check_work(8);
        assert_ne!(v1, v3);
    }

    #[test]
    fn trivial_bits_make_every_nonce_a_block() {
        // exponent 0x20, mantissa 0xffffff: the target covers nearly the whole
        // 256-bit range, so a handful of nonces must contain a solve.
        let header = test_header(0x20ffffff);
        let pow = PowState::new(&header);
        let solved = (0u64..8).any(|n| pow.check_work(n).0);
        assert!(solved);
    }

    #[test]
    fn impossible_bits_reject_every_nonce() {
        let header = test_header(0x03000001);
        let pow = PowState::new(&header);
        assert!((0u64..8).all(|n| !pow.check_work(n).0));
    }
}
