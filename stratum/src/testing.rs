//! Shared test doubles for the stratum crate

use std::sync::Mutex;

use async_trait::async_trait;

use lodepool_consensus::{ConsensusParameters, HeaderHasher, Target};
use lodepool_core::template::{BlockTemplate, TemplateHeader};
use lodepool_rpc::{
    AccountBalance, BlockInfo, BlockTemplateStream, NodeClient, RpcError, SendTransactionRequest,
    SendTransactionResponse, SubmitBlockResult, TransactionStatusInfo,
};

/// Kernel scripted to return one fixed hash
pub struct FixedKernel(pub [u8; 32]);

impl HeaderHasher for FixedKernel {
    fn hash_header(&self, _header_bytes: &[u8]) -> [u8; 32] {
        self.0
    }
}

/// Node double that records block submissions
#[derive(Default)]
pub struct MockNode {
    pub submitted: Mutex<Vec<BlockTemplate>>,
}

#[async_trait]
impl NodeClient for MockNode {
    async fn block_template_stream(&self) -> Result<BlockTemplateStream, RpcError> {
        Ok(BlockTemplateStream::from_templates(Vec::new()))
    }

    async fn submit_block(&self, template: &BlockTemplate) -> Result<SubmitBlockResult, RpcError> {
        self.submitted.lock().unwrap().push(template.clone());
        Ok(SubmitBlockResult {
            added: true,
            reason: None,
        })
    }

    async fn get_account_balance(&self, _account: Option<&str>) -> Result<AccountBalance, RpcError> {
        unimplemented!("not used by the stratum tests")
    }

    async fn send_transaction(
        &self,
        _request: &SendTransactionRequest,
    ) -> Result<SendTransactionResponse, RpcError> {
        unimplemented!("not used by the stratum tests")
    }

    async fn get_consensus_parameters(&self) -> Result<ConsensusParameters, RpcError> {
        Ok(ConsensusParameters::default())
    }

    async fn get_block_info(&self, _hash: &str) -> Result<BlockInfo, RpcError> {
        unimplemented!("not used by the stratum tests")
    }

    async fn get_transaction_status(&self, _hash: &str) -> Result<TransactionStatusInfo, RpcError> {
        unimplemented!("not used by the stratum tests")
    }

    async fn try_connect(&self) -> bool {
        true
    }
}

/// Network target with two leading zero bytes
pub fn network_target() -> Target {
    let mut bytes = [0xff; 32];
    bytes[0] = 0x00;
    bytes[1] = 0x00;
    Target(bytes)
}

/// Pool target with one leading zero byte
pub fn pool_target() -> Target {
    let mut bytes = [0xff; 32];
    bytes[0] = 0x00;
    Target(bytes)
}

/// Hash inside the pool target but outside the network target
pub fn share_hash() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[1] = 0x80;
    bytes
}

/// Hash inside both targets
pub fn block_hash() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[2] = 0xab;
    bytes
}

/// Hash outside both targets
pub fn high_hash() -> [u8; 32] {
    [0xf0; 32]
}

/// A template with all-zero fields under the test network target
pub fn zero_template() -> BlockTemplate {
    BlockTemplate {
        header: TemplateHeader {
            sequence: 1,
            previous_block_hash: hex::encode([0u8; 32]),
            note_commitment: hex::encode([0u8; 32]),
            transaction_commitment: hex::encode([0u8; 32]),
            target: network_target().to_hex(),
            timestamp: 1_700_000_000_000,
            graffiti: hex::encode([0u8; 32]),
            randomness: "0000000000000000".to_string(),
        },
        miner_reward: 1_000_000,
        transactions: Vec::new(),
        previous_block_info: None,
    }
}
