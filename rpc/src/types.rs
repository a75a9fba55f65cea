//! Wire types of the upstream node's RPC surface

use serde::{Deserialize, Serialize};

/// Asset id of the native Lodestone asset, the only asset paid out
pub const NATIVE_ASSET_ID: &str =
    "51f33a2f14f92735e562dc658a5639279ddca3d5079a6d1242b2a588a9cbf44c";

/// Result of `miner/submitBlock`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBlockResult {
    /// Whether the node accepted the block
    pub added: bool,

    /// Rejection reason when not added
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of `wallet/getAccountBalance`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    /// Confirmed balance in native units, decimal string
    pub confirmed: String,

    /// Spendable balance in native units, decimal string
    pub available: String,
}

/// One recipient of a payout transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutput {
    /// Recipient payout address
    pub public_address: String,

    /// Amount in native units
    pub amount: u64,

    /// Human-readable memo
    pub memo: String,

    /// Asset being transferred
    pub asset_id: String,
}

/// Request body of `wallet/sendTransaction`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionRequest {
    /// Source account; the node's default account when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Recipients
    pub outputs: Vec<TransactionOutput>,

    /// Fee in native units
    pub fee: u64,

    /// Sequences until the transaction expires unconfirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_delta: Option<u32>,
}

/// Result of `wallet/sendTransaction`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionResponse {
    /// Hash of the created transaction
    pub hash: String,
}

/// Result of `chain/getBlockInfo`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// Whether the block is on the main chain
    pub main: bool,

    /// Whether the block is buried past the confirmation depth
    pub confirmed: bool,
}

/// Result of `wallet/getTransactionStatus`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusInfo {
    /// Whether the transaction is confirmed on the main chain
    pub confirmed: bool,

    /// Whether the transaction expired unconfirmed
    pub expired: bool,
}
