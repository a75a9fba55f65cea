//! Upstream Node Client for lodepool
//!
//! The pool consumes the Lodestone full node through a narrow
//! interface: a stream of block templates, block submission, account
//! balance and transaction calls for payouts, and status lookups for
//! reconciliation. `NodeClient` is that interface; `TcpNodeClient` is
//! the production implementation speaking the node's line-delimited
//! JSON protocol.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use lodepool_consensus::ConsensusParameters;
use lodepool_core::BlockTemplate;

pub mod client;
pub mod types;

pub use client::TcpNodeClient;
pub use types::{
    AccountBalance, BlockInfo, SendTransactionRequest, SendTransactionResponse,
    SubmitBlockResult, TransactionOutput, TransactionStatusInfo, NATIVE_ASSET_ID,
};

/// Node client errors
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The node returned an error response
    #[error("Node error: {0}")]
    Node(String),

    /// The connection closed before a response arrived
    #[error("Node connection closed")]
    Disconnected,

    /// The node sent a message the client cannot interpret
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A live stream of block templates from the upstream node.
///
/// `next` returns `None` when the node connection closes; the caller
/// reconnects and requests a fresh stream.
pub struct BlockTemplateStream {
    rx: mpsc::Receiver<BlockTemplate>,
}

impl BlockTemplateStream {
    pub fn new(rx: mpsc::Receiver<BlockTemplate>) -> Self {
        BlockTemplateStream { rx }
    }

    /// A finite stream over pre-built templates
    pub fn from_templates(templates: Vec<BlockTemplate>) -> Self {
        let (tx, rx) = mpsc::channel(templates.len().max(1));
        for template in templates {
            // Capacity covers every template, so try_send cannot fail.
            let _ = tx.try_send(template);
        }
        BlockTemplateStream { rx }
    }

    /// Next template, or `None` once the node disconnects
    pub async fn next(&mut self) -> Option<BlockTemplate> {
        self.rx.recv().await
    }
}

/// The narrow interface the pool consumes the upstream node through
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Open a stream of block templates for the chain head
    async fn block_template_stream(&self) -> Result<BlockTemplateStream, RpcError>;

    /// Submit a fully mined template to the network
    async fn submit_block(&self, template: &BlockTemplate) -> Result<SubmitBlockResult, RpcError>;

    /// Balance of the pool's payout account
    async fn get_account_balance(&self, account: Option<&str>) -> Result<AccountBalance, RpcError>;

    /// Send a payout transaction
    async fn send_transaction(
        &self,
        request: &SendTransactionRequest,
    ) -> Result<SendTransactionResponse, RpcError>;

    /// Chain parameters for difficulty recomputation
    async fn get_consensus_parameters(&self) -> Result<ConsensusParameters, RpcError>;

    /// Main/confirmed status of a block by hash
    async fn get_block_info(&self, hash: &str) -> Result<BlockInfo, RpcError>;

    /// Confirmed/expired status of a transaction by hash
    async fn get_transaction_status(&self, hash: &str)
        -> Result<TransactionStatusInfo, RpcError>;

    /// Probe whether the node is reachable
    async fn try_connect(&self) -> bool;
}
