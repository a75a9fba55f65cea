//! Target Codec and Difficulty Recomputation
//!
//! A target is a 256-bit unsigned big-endian integer in 32 bytes; a
//! header hash meets a target when the hash, read the same way, is
//! less than or equal to it. Difficulty is the integer quotient
//! `MAX_TARGET / target`, so a lower target means higher difficulty.
//!
//! Between incoming templates the pool re-derives the target as wall
//! clock advances: difficulty rises by one step when a solution
//! arrives inside the first bucket and decays by one step per
//! additional elapsed bucket, clamped downward and floored at the
//! chain minimum.

use log::debug;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use once_cell::sync::Lazy;

use crate::ConsensusParameters;

/// `2^256 - 1`, the lowest possible difficulty's target
static MAX_TARGET: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&[0xff; 32]));

/// A 256-bit proof-of-work target, big-endian.
///
/// Byte-wise ordering of the fixed array coincides with numeric
/// ordering of the big-endian integer, so the derived `Ord` is the
/// numeric one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// The all-ones target, met by every hash
    pub const MAX: Target = Target([0xff; 32]);

    /// Parse a target from 64 hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, crate::ConsensusError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| crate::ConsensusError::InvalidTarget(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(crate::ConsensusError::InvalidTarget(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Target(out))
    }

    /// Lowercase hex form, 64 characters
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The target whose difficulty is `difficulty`
    pub fn from_difficulty(difficulty: &BigUint) -> Self {
        if difficulty.is_zero() {
            return Target::MAX;
        }

        let value = &*MAX_TARGET / difficulty;
        let bytes = value.to_bytes_be();
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Target(out)
    }

    /// `MAX_TARGET / target`, integer division. The zero target is
    /// unreachable work and maps to the maximum difficulty.
    pub fn to_difficulty(&self) -> BigUint {
        let value = BigUint::from_bytes_be(&self.0);
        if value.is_zero() {
            return MAX_TARGET.clone();
        }
        &*MAX_TARGET / value
    }

    /// Whether `hash`, as a 256-bit big-endian integer, is `<=` this target
    pub fn meets(&self, hash: &[u8; 32]) -> bool {
        hash <= &self.0
    }
}

/// Recompute difficulty for the present wall-clock moment.
///
/// `head_difficulty` and `head_ts_ms` describe the current chain head;
/// `sequence` is the height being mined. Difficulty steps up by
/// `head / denominator` when fewer than one bucket has elapsed and
/// down by the same amount per additional bucket, clamped to
/// `max_downward_buckets` and floored at `min_difficulty`.
pub fn calculate_difficulty(
    params: &ConsensusParameters,
    sequence: u32,
    now_ms: i64,
    head_ts_ms: i64,
    head_difficulty: &BigUint,
) -> BigUint {
    let min_difficulty = BigUint::from(params.min_difficulty);
    if sequence == 0 {
        return min_difficulty;
    }

    let elapsed_sec = (now_ms.saturating_sub(head_ts_ms)).max(0) as u64 / 1000;
    let buckets = (elapsed_sec / params.difficulty_bucket_sec.max(1)) as i64;
    let steps = (1 - buckets).max(-(params.max_downward_buckets as i64));

    let step_size = head_difficulty / BigUint::from(params.difficulty_adjustment_denominator);
    let delta = &step_size * BigUint::from(steps.unsigned_abs());

    let adjusted = if steps >= 0 {
        head_difficulty + delta
    } else if delta < *head_difficulty {
        head_difficulty - delta
    } else {
        BigUint::one()
    };
    let adjusted = adjusted.max(min_difficulty);

    debug!(
        "Difficulty recomputation: head={}, new={}, elapsed={}s, steps={}",
        head_difficulty, adjusted, elapsed_sec, steps
    );
    adjusted
}
