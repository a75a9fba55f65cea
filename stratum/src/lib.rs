//! Stratum Session Layer for lodepool
//!
//! This module implements the pool side of the Lodestone stratum
//! protocol: a line-delimited JSON request/response and notification
//! protocol over TCP or TLS. It covers message framing, schema
//! validation, per-IP peer policy with ban scoring, the client
//! session server with broadcast fan-out, the work distributor fed by
//! the upstream template stream, and share validation.

use std::path::PathBuf;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lodepool_consensus::Target;

pub mod codec;
pub mod distributor;
pub mod messages;
pub mod peers;
pub mod server;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

// Re-export stratum types
pub use codec::MessageBuffer;
pub use distributor::{WorkBroadcast, WorkDistributor};
pub use peers::PeerPolicy;
pub use server::{ClientSession, StratumServer};
pub use validator::{SubmissionOutcome, SubmissionProcessor};

/// Stratum protocol errors
#[derive(Debug, Error)]
pub enum StratumError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame was not valid UTF-8
    #[error("Frame is not valid UTF-8")]
    NonUtf8Frame,

    /// A request body failed schema validation
    #[error("Malformed body for method '{method}'")]
    Malformed { method: String },

    /// Header construction error
    #[error("Header error: {0}")]
    Header(#[from] lodepool_core::HeaderError),

    /// Consensus arithmetic error
    #[error("Consensus error: {0}")]
    Consensus(#[from] lodepool_consensus::ConsensusError),

    /// Share store error
    #[error("Store error: {0}")]
    Store(#[from] lodepool_database::StoreError),

    /// Upstream node error
    #[error("Node error: {0}")]
    Rpc(#[from] lodepool_rpc::RpcError),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// The configured pool name cannot produce a valid graffiti
    #[error("Invalid graffiti configuration: {0}")]
    InvalidGraffiti(String),
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    /// Name of the pool, embedded in graffiti and payout memos
    pub pool_name: String,

    /// Stratum listen host
    pub pool_host: String,

    /// Stratum listen port
    pub pool_port: u16,

    /// Share-target difficulty
    pub pool_difficulty: u64,

    /// Connections allowed per remote IP; 0 disables the cap
    pub pool_max_connections_per_ip: u32,

    /// Whether misbehaving clients are banned; when false they are
    /// shadow-banned instead
    pub pool_banning: bool,

    /// Window in seconds for "recent share" status estimates
    pub pool_recent_share_cutoff: u64,

    /// Node wallet account payouts are sent from
    pub pool_account_name: Option<String>,

    /// Payout period length in seconds
    pub pool_payout_period_duration: u64,

    /// Legacy percent-of-balance payout knob, superseded by
    /// `balancePercentPayoutFlag`
    pub pool_balance_percent_payout: u64,

    /// Override for the legacy percent-of-balance knob, 0-100
    pub balance_percent_payout_flag: Option<u8>,

    /// Sequences until a payout transaction expires unconfirmed
    pub transaction_expiration_delta: u32,

    /// Upstream node RPC address
    pub node_address: String,

    /// Share store location
    pub database_path: PathBuf,

    /// TLS certificate chain in PEM form; plain TCP when absent
    pub tls_cert_path: Option<PathBuf>,

    /// TLS private key in PEM form
    pub tls_key_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_name: "lodepool".to_string(),
            pool_host: "0.0.0.0".to_string(),
            pool_port: 9034,
            pool_difficulty: 1_000_000,
            pool_max_connections_per_ip: 8,
            pool_banning: true,
            pool_recent_share_cutoff: 3600,
            pool_account_name: None,
            pool_payout_period_duration: 7200,
            pool_balance_percent_payout: 10,
            balance_percent_payout_flag: None,
            transaction_expiration_delta: 30,
            node_address: "127.0.0.1:8020".to_string(),
            database_path: PathBuf::from("data/lodepool.sqlite"),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl PoolConfig {
    /// The share target every subscriber mines against
    pub fn pool_target(&self) -> Target {
        Target::from_difficulty(&BigUint::from(self.pool_difficulty.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_target_tracks_difficulty() {
        let mut config = PoolConfig::default();
        config.pool_difficulty = 1;
        assert_eq!(config.pool_target(), Target::MAX);

        config.pool_difficulty = 2;
        assert!(config.pool_target() < Target::MAX);
    }

    #[test]
    fn test_config_accepts_wire_option_names() {
        let json = r#"{
            "poolName": "testpool",
            "poolPort": 1234,
            "poolMaxConnectionsPerIp": 0,
            "poolBanning": false,
            "balancePercentPayoutFlag": 50
        }"#;
        let config: PoolConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pool_name, "testpool");
        assert_eq!(config.pool_port, 1234);
        assert_eq!(config.pool_max_connections_per_ip, 0);
        assert!(!config.pool_banning);
        assert_eq!(config.balance_percent_payout_flag, Some(50));
        // Unset options fall back to defaults.
        assert_eq!(config.pool_difficulty, PoolConfig::default().pool_difficulty);
    }
}
