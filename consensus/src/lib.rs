//! Consensus arithmetic for lodepool
//!
//! This module implements the 256-bit proof-of-work target codec, the
//! wall-clock difficulty recomputation rule used to keep distributed
//! work honest between blocks, and the opaque header-hash kernel seam.
//! The heavy native hashing kernels live outside the pool; everything
//! here treats a header hash as a pure function of 180 bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod difficulty;
pub mod kernel;

// Re-export consensus types
pub use difficulty::{calculate_difficulty, Target};
pub use kernel::{DoubleSha256Kernel, HeaderHasher};

/// Consensus errors
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A target string failed hex decoding or has the wrong size
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

/// Chain parameters governing difficulty recomputation.
///
/// Served by the upstream node's `getConsensusParameters`; the defaults
/// match the Lodestone mainnet and are used when the node predates the
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusParameters {
    /// Target seconds between blocks
    pub target_block_time_sec: u64,

    /// One adjustment step accrues per this many elapsed seconds
    pub difficulty_bucket_sec: u64,

    /// Each step moves difficulty by head_difficulty / this denominator
    pub difficulty_adjustment_denominator: u64,

    /// Downward steps are clamped to this many buckets
    pub max_downward_buckets: u64,

    /// Difficulty floor
    pub min_difficulty: u64,
}

impl Default for ConsensusParameters {
    fn default() -> Self {
        ConsensusParameters {
            target_block_time_sec: 60,
            difficulty_bucket_sec: 10,
            difficulty_adjustment_denominator: 2048,
            max_downward_buckets: 99,
            min_difficulty: 131_072,
        }
    }
}
