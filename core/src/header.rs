//! Mineable Block Header for Lodestone
//!
//! This module defines the fixed-size byte form of a block header that
//! miners search over. The serialization is exactly 180 bytes with the
//! graffiti occupying the final 32 bytes, so a pool can splice a
//! solver's randomness and its assigned graffiti into distributed work
//! without reserializing the whole template.

use serde::{Deserialize, Serialize};

use crate::{Hash, HeaderError};

/// Serialized header length in bytes
pub const HEADER_LEN: usize = 180;

/// Randomness (nonce) length in bytes
pub const RANDOMNESS_LEN: usize = 8;

/// Graffiti length in bytes
pub const GRAFFITI_LEN: usize = 32;

/// Byte offset of the graffiti window within the serialized header
pub const GRAFFITI_OFFSET: usize = HEADER_LEN - GRAFFITI_LEN;

/// A block header in its mineable form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MineableHeader {
    /// Nonce varied by the miner
    pub randomness: [u8; RANDOMNESS_LEN],

    /// Block sequence number
    pub sequence: u32,

    /// Hash of the previous block
    pub previous_block_hash: Hash,

    /// Note commitment
    pub note_commitment: Hash,

    /// Transaction commitment
    pub transaction_commitment: Hash,

    /// Proof-of-work target, big-endian
    pub target: Hash,

    /// Block timestamp in milliseconds since the epoch
    pub timestamp: u64,

    /// Solver tag embedded by the pool
    pub graffiti: [u8; GRAFFITI_LEN],
}

impl MineableHeader {
    /// Serialize the header into its fixed 180-byte mineable form
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..8].copy_from_slice(&self.randomness);
        bytes[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[12..44].copy_from_slice(&self.previous_block_hash);
        bytes[44..76].copy_from_slice(&self.note_commitment);
        bytes[76..108].copy_from_slice(&self.transaction_commitment);
        bytes[108..140].copy_from_slice(&self.target);
        bytes[140..148].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[GRAFFITI_OFFSET..].copy_from_slice(&self.graffiti);
        bytes
    }

    /// Parse a header from its serialized form
    pub fn deserialize(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() != HEADER_LEN {
            return Err(HeaderError::InvalidLength(bytes.len()));
        }

        let mut randomness = [0u8; RANDOMNESS_LEN];
        let mut sequence = [0u8; 4];
        let mut previous_block_hash = [0u8; 32];
        let mut note_commitment = [0u8; 32];
        let mut transaction_commitment = [0u8; 32];
        let mut target = [0u8; 32];
        let mut timestamp = [0u8; 8];
        let mut graffiti = [0u8; GRAFFITI_LEN];

        randomness.copy_from_slice(&bytes[0..8]);
        sequence.copy_from_slice(&bytes[8..12]);
        previous_block_hash.copy_from_slice(&bytes[12..44]);
        note_commitment.copy_from_slice(&bytes[44..76]);
        transaction_commitment.copy_from_slice(&bytes[76..108]);
        target.copy_from_slice(&bytes[108..140]);
        timestamp.copy_from_slice(&bytes[140..148]);
        graffiti.copy_from_slice(&bytes[GRAFFITI_OFFSET..]);

        Ok(MineableHeader {
            randomness,
            sequence: u32::from_be_bytes(sequence),
            previous_block_hash,
            note_commitment,
            transaction_commitment,
            target,
            timestamp: u64::from_be_bytes(timestamp),
            graffiti,
        })
    }

    /// Set the graffiti from a UTF-8 string, zero-padded on the right.
    ///
    /// Fails if the string does not fit the fixed 32-byte window.
    pub fn set_graffiti_str(&mut self, graffiti: &str) -> Result<(), HeaderError> {
        let bytes = graffiti.as_bytes();
        if bytes.len() > GRAFFITI_LEN {
            return Err(HeaderError::InvalidGraffiti(bytes.len()));
        }

        self.graffiti = [0u8; GRAFFITI_LEN];
        self.graffiti[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> MineableHeader {
        MineableHeader {
            randomness: [1, 2, 3, 4, 5, 6, 7, 8],
            sequence: 42,
            previous_block_hash: [0xaa; 32],
            note_commitment: [0xbb; 32],
            transaction_commitment: [0xcc; 32],
            target: [0x0f; 32],
            timestamp: 1_700_000_000_000,
            graffiti: [0; 32],
        }
    }

    #[test]
    fn test_serialized_length() {
        assert_eq!(sample_header().serialize().len(), HEADER_LEN);
    }

    #[test]
    fn test_round_trip() {
        let header = sample_header();
        let parsed = MineableHeader::deserialize(&header.serialize()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_graffiti_occupies_final_window() {
        let mut header = sample_header();
        header.set_graffiti_str("lodepool.2a").unwrap();
        let bytes = header.serialize();
        assert_eq!(&bytes[GRAFFITI_OFFSET..GRAFFITI_OFFSET + 11], b"lodepool.2a");
        assert!(bytes[GRAFFITI_OFFSET + 11..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_graffiti_too_long_rejected() {
        let mut header = sample_header();
        let long = "x".repeat(GRAFFITI_LEN + 1);
        assert!(matches!(
            header.set_graffiti_str(&long),
            Err(HeaderError::InvalidGraffiti(33))
        ));
    }

    #[test]
    fn test_graffiti_exactly_32_bytes_accepted() {
        let mut header = sample_header();
        let exact = "y".repeat(GRAFFITI_LEN);
        header.set_graffiti_str(&exact).unwrap();
        assert_eq!(&header.graffiti, exact.as_bytes());
    }

    #[test]
    fn test_deserialize_rejects_wrong_length() {
        assert!(matches!(
            MineableHeader::deserialize(&[0u8; HEADER_LEN - 1]),
            Err(HeaderError::InvalidLength(179))
        ));
    }

    #[test]
    fn test_sequence_and_timestamp_big_endian() {
        let header = sample_header();
        let bytes = header.serialize();
        assert_eq!(&bytes[8..12], &42u32.to_be_bytes());
        assert_eq!(&bytes[140..148], &1_700_000_000_000u64.to_be_bytes());
    }
}
