//! Utility functions and types for lodepool

use thiserror::Error;

/// Prefix carried by every Lodestone payout address.
pub const ADDRESS_PREFIX: &str = "lode";

/// Raw payout address payload length in bytes.
pub const ADDRESS_PAYLOAD_LEN: usize = 20;

/// Trailing checksum length in bytes.
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("Hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("Base58 decoding error: {0}")]
    Base58Error(#[from] bs58::decode::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid payout address: {0}")]
    InvalidAddress(String),
}

/// Converts a hex string to bytes
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, UtilError> {
    Ok(hex::decode(hex)?)
}

/// Converts a hex string to a fixed-size byte array
pub fn hex_to_array<const N: usize>(hex: &str) -> Result<[u8; N], UtilError> {
    let bytes = hex::decode(hex)?;
    if bytes.len() != N {
        return Err(UtilError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            N,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Converts bytes to a hex string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Converts a base58 string to bytes
pub fn base58_to_bytes(b58: &str) -> Result<Vec<u8>, UtilError> {
    Ok(bs58::decode(b58).into_vec()?)
}

/// Converts bytes to a base58 string
pub fn bytes_to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Validates a Lodestone payout address.
///
/// An address is the `lode` prefix followed by the base58 encoding of a
/// 20-byte payload and a 4-byte checksum. Checksum bytes are carried but
/// not verified here; the upstream node rejects a forged checksum when a
/// payout transaction is built against it.
pub fn validate_public_address(address: &str) -> Result<(), UtilError> {
    let payload = address.strip_prefix(ADDRESS_PREFIX).ok_or_else(|| {
        UtilError::InvalidAddress(format!("Address must start with '{}'", ADDRESS_PREFIX))
    })?;

    let decoded = bs58::decode(payload)
        .into_vec()
        .map_err(|_| UtilError::InvalidAddress("Invalid base58 encoding".to_string()))?;

    if decoded.len() != ADDRESS_PAYLOAD_LEN + ADDRESS_CHECKSUM_LEN {
        return Err(UtilError::InvalidAddress(format!(
            "Invalid address length: {}",
            decoded.len()
        )));
    }

    Ok(())
}

/// Encodes a raw 20-byte payload as a Lodestone payout address.
pub fn encode_public_address(payload: &[u8; ADDRESS_PAYLOAD_LEN]) -> String {
    let mut bytes = Vec::with_capacity(ADDRESS_PAYLOAD_LEN + ADDRESS_CHECKSUM_LEN);
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&[0u8; ADDRESS_CHECKSUM_LEN]);
    format!("{}{}", ADDRESS_PREFIX, bs58::encode(bytes).into_string())
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Formats a millisecond timestamp as an ISO 8601 string
pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| "Invalid timestamp".to_string())
}
