//! Block Templates and Mining Requests
//!
//! A block template is the unit of work streamed from the upstream
//! Lodestone node. The pool assigns each distributed template a
//! monotonically increasing mining request id; only the most recent id
//! is current, while a bounded number of predecessors are kept so very
//! recently replaced work can still be identified (and rejected) by id.

use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::header::{MineableHeader, GRAFFITI_LEN, RANDOMNESS_LEN};
use crate::HeaderError;

/// Number of recent mining requests kept for stale-work identification
pub const MINING_REQUEST_CACHE_CAPACITY: usize = 12;

/// Header fields of a block template, hex-encoded as on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateHeader {
    /// Block sequence number
    pub sequence: u32,

    /// Hash of the previous block, hex
    pub previous_block_hash: String,

    /// Note commitment, hex
    pub note_commitment: String,

    /// Transaction commitment, hex
    pub transaction_commitment: String,

    /// Proof-of-work target, hex, big-endian
    pub target: String,

    /// Block timestamp in milliseconds since the epoch
    pub timestamp: i64,

    /// Graffiti, hex
    pub graffiti: String,

    /// Randomness, hex, interpreted as 8 bytes
    pub randomness: String,
}

/// Target and timestamp of the block a template builds on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousBlockInfo {
    /// Proof-of-work target of the previous block, hex
    pub target: String,

    /// Timestamp of the previous block in milliseconds since the epoch
    pub timestamp: i64,
}

/// A block template streamed from the upstream node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTemplate {
    /// Header fields of the block being mined
    pub header: TemplateHeader,

    /// Reward the block pays its producer, in native units
    #[serde(default)]
    pub miner_reward: i64,

    /// Serialized transactions, opaque to the pool
    #[serde(default)]
    pub transactions: Vec<String>,

    /// Chain-head context used for target recomputation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_block_info: Option<PreviousBlockInfo>,
}

impl BlockTemplate {
    /// Derive the mineable header from this template's fields
    pub fn mineable_header(&self) -> Result<MineableHeader, HeaderError> {
        let header = &self.header;

        Ok(MineableHeader {
            randomness: decode_field::<RANDOMNESS_LEN>("randomness", &header.randomness)?,
            sequence: header.sequence,
            previous_block_hash: decode_field::<32>(
                "previousBlockHash",
                &header.previous_block_hash,
            )?,
            note_commitment: decode_field::<32>("noteCommitment", &header.note_commitment)?,
            transaction_commitment: decode_field::<32>(
                "transactionCommitment",
                &header.transaction_commitment,
            )?,
            target: decode_field::<32>("target", &header.target)?,
            timestamp: header.timestamp.max(0) as u64,
            graffiti: decode_field::<GRAFFITI_LEN>("graffiti", &header.graffiti)?,
        })
    }
}

fn decode_field<const N: usize>(field: &'static str, hex_str: &str) -> Result<[u8; N], HeaderError> {
    lodepool_util::hex_to_array::<N>(hex_str).map_err(|e| HeaderError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

/// A block template paired with its server-assigned mining request id
#[derive(Debug, Clone)]
pub struct MiningRequest {
    /// Monotonically increasing id identifying this unit of work
    pub id: u32,

    /// The template the work was derived from
    pub template: BlockTemplate,
}

/// Bounded cache of recently distributed mining requests.
///
/// Insertion evicts the oldest entry once capacity is reached. Lookups
/// do not refresh recency: an old request stays old even if a late
/// submission touches it.
pub struct MiningRequestCache {
    entries: LruCache<u32, BlockTemplate>,
}

impl MiningRequestCache {
    pub fn new() -> Self {
        MiningRequestCache {
            entries: LruCache::new(
                NonZeroUsize::new(MINING_REQUEST_CACHE_CAPACITY).expect("capacity is non-zero"),
            ),
        }
    }

    /// Insert a template under its mining request id
    pub fn insert(&mut self, id: u32, template: BlockTemplate) {
        self.entries.put(id, template);
    }

    /// Look up a template by mining request id
    pub fn get(&self, id: u32) -> Option<&BlockTemplate> {
        self.entries.peek(&id)
    }

    /// Number of cached requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MiningRequestCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample_template(sequence: u32) -> BlockTemplate {
        BlockTemplate {
            header: TemplateHeader {
                sequence,
                previous_block_hash: hex::encode([0u8; 32]),
                note_commitment: hex::encode([0u8; 32]),
                transaction_commitment: hex::encode([0u8; 32]),
                target: hex::encode([0xff; 32]),
                timestamp: 1_700_000_000_000,
                graffiti: hex::encode([0u8; 32]),
                randomness: "0000000000000000".to_string(),
            },
            miner_reward: 0,
            transactions: Vec::new(),
            previous_block_info: None,
        }
    }

    #[test]
    fn test_mineable_header_from_template() {
        let template = sample_template(9);
        let header = template.mineable_header().unwrap();
        assert_eq!(header.sequence, 9);
        assert_eq!(header.target, [0xff; 32]);
        assert_eq!(header.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_mineable_header_rejects_bad_field() {
        let mut template = sample_template(1);
        template.header.randomness = "zz".to_string();
        assert!(matches!(
            template.mineable_header(),
            Err(HeaderError::InvalidField { field: "randomness", .. })
        ));
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = MiningRequestCache::new();
        for id in 0..(MINING_REQUEST_CACHE_CAPACITY as u32 + 1) {
            cache.insert(id, sample_template(id));
        }

        assert_eq!(cache.len(), MINING_REQUEST_CACHE_CAPACITY);
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(MINING_REQUEST_CACHE_CAPACITY as u32).is_some());
    }

    #[test]
    fn test_template_json_round_trip() {
        let template = sample_template(3);
        let json = serde_json::to_string(&template).unwrap();
        assert!(json.contains("previousBlockHash"));
        let parsed: BlockTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, template);
    }
}
