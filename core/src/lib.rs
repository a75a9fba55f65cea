//! Core types and data structures for lodepool
//!
//! This module defines the block template wire model streamed from the
//! upstream Lodestone node, the fixed-size mineable header derived from
//! it, and the bounded cache of recently distributed mining requests.

use thiserror::Error;

pub mod header;
pub mod template;

// Re-export core types
pub use header::{MineableHeader, GRAFFITI_LEN, GRAFFITI_OFFSET, HEADER_LEN, RANDOMNESS_LEN};
pub use template::{
    BlockTemplate, MiningRequest, MiningRequestCache, PreviousBlockInfo, TemplateHeader,
    MINING_REQUEST_CACHE_CAPACITY,
};

/// A 32-byte hash
pub type Hash = [u8; 32];

/// Header construction and parsing errors
#[derive(Debug, Error)]
pub enum HeaderError {
    /// Serialized header has the wrong length
    #[error("Invalid header length: expected 180 bytes, got {0}")]
    InvalidLength(usize),

    /// Graffiti does not fit the fixed 32-byte window
    #[error("Invalid graffiti: {0} bytes exceeds the 32-byte window")]
    InvalidGraffiti(usize),

    /// A template field failed hex decoding or has the wrong size
    #[error("Invalid template field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}
