//! TCP Node Client
//!
//! The Lodestone node serves its RPC surface over a line-delimited
//! JSON protocol: one request envelope per line, answered by a
//! response envelope, with streaming methods emitting `stream`
//! envelopes until the connection closes. Unary calls use a fresh
//! connection per request; the template stream holds its connection
//! open for the life of the subscription.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use lodepool_consensus::ConsensusParameters;
use lodepool_core::BlockTemplate;

use crate::types::{
    AccountBalance, BlockInfo, SendTransactionRequest, SendTransactionResponse,
    SubmitBlockResult, TransactionStatusInfo,
};
use crate::{BlockTemplateStream, NodeClient, RpcError};

/// Capacity of the template stream channel
const TEMPLATE_STREAM_BUFFER: usize = 8;

#[derive(Serialize)]
struct RequestEnvelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: u64,
    method: &'a str,
    params: T,
}

#[derive(serde::Deserialize)]
struct ResponseEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: u64,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

/// Node client over the line-delimited JSON protocol
pub struct TcpNodeClient {
    address: String,
    next_id: AtomicU64,
}

impl TcpNodeClient {
    pub fn new(address: impl Into<String>) -> Self {
        TcpNodeClient {
            address: address.into(),
            next_id: AtomicU64::new(0),
        }
    }

    async fn open(&self) -> Result<TcpStream, RpcError> {
        Ok(TcpStream::connect(&self.address).await?)
    }

    async fn write_request<T: Serialize>(
        &self,
        stream: &mut TcpStream,
        method: &str,
        params: T,
    ) -> Result<u64, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope {
            kind: "request",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(id)
    }

    /// Issue a unary request and wait for its response envelope
    async fn call<T: Serialize>(&self, method: &str, params: T) -> Result<Value, RpcError> {
        let mut stream = self.open().await?;
        let id = self.write_request(&mut stream, method, params).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                return Err(RpcError::Disconnected);
            }

            let envelope: ResponseEnvelope = serde_json::from_str(line.trim_end())?;
            if envelope.id != id {
                debug!("Ignoring response for request {}", envelope.id);
                continue;
            }

            return match envelope.kind.as_str() {
                "response" => Ok(envelope.data),
                "error" => Err(RpcError::Node(
                    envelope.message.unwrap_or_else(|| "unknown error".to_string()),
                )),
                other => Err(RpcError::InvalidResponse(format!(
                    "unexpected envelope type '{}'",
                    other
                ))),
            };
        }
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    async fn block_template_stream(&self) -> Result<BlockTemplateStream, RpcError> {
        let mut stream = self.open().await?;
        let id = self
            .write_request(&mut stream, "miner/blockTemplateStream", json!({}))
            .await?;

        let (tx, rx) = mpsc::channel(TEMPLATE_STREAM_BUFFER);
        let address = self.address.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Template stream read error from {}: {}", address, e);
                        break;
                    }
                }

                let envelope: ResponseEnvelope = match serde_json::from_str(line.trim_end()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Malformed template stream message from {}: {}", address, e);
                        break;
                    }
                };

                if envelope.id != id || envelope.kind != "stream" {
                    continue;
                }

                match serde_json::from_value::<BlockTemplate>(envelope.data) {
                    Ok(template) => {
                        if tx.send(template).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Undecodable block template from {}: {}", address, e);
                        break;
                    }
                }
            }
            // Dropping tx ends the stream; the distributor reconnects.
        });

        Ok(BlockTemplateStream::new(rx))
    }

    async fn submit_block(&self, template: &BlockTemplate) -> Result<SubmitBlockResult, RpcError> {
        let data = self.call("miner/submitBlock", template).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn get_account_balance(&self, account: Option<&str>) -> Result<AccountBalance, RpcError> {
        let data = self
            .call("wallet/getAccountBalance", json!({ "account": account }))
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn send_transaction(
        &self,
        request: &SendTransactionRequest,
    ) -> Result<SendTransactionResponse, RpcError> {
        let data = self.call("wallet/sendTransaction", request).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn get_consensus_parameters(&self) -> Result<ConsensusParameters, RpcError> {
        let data = self.call("chain/getConsensusParameters", json!({})).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn get_block_info(&self, hash: &str) -> Result<BlockInfo, RpcError> {
        let data = self.call("chain/getBlockInfo", json!({ "hash": hash })).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn get_transaction_status(
        &self,
        hash: &str,
    ) -> Result<TransactionStatusInfo, RpcError> {
        let data = self
            .call("wallet/getTransactionStatus", json!({ "hash": hash }))
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn try_connect(&self) -> bool {
        TcpStream::connect(&self.address).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_shape() {
        let envelope = RequestEnvelope {
            kind: "request",
            id: 7,
            method: "miner/submitBlock",
            params: json!({ "x": 1 }),
        };
        let line = serde_json::to_string(&envelope).unwrap();
        assert!(line.contains("\"type\":\"request\""));
        assert!(line.contains("\"method\":\"miner/submitBlock\""));
    }

    #[tokio::test]
    async fn test_finite_stream_yields_then_ends() {
        use lodepool_core::template::BlockTemplate;

        let json = serde_json::json!({
            "header": {
                "sequence": 1,
                "previousBlockHash": "00".repeat(32),
                "noteCommitment": "00".repeat(32),
                "transactionCommitment": "00".repeat(32),
                "target": "ff".repeat(32),
                "timestamp": 0,
                "graffiti": "00".repeat(32),
                "randomness": "0000000000000000",
            },
        });
        let template: BlockTemplate = serde_json::from_value(json).unwrap();

        let mut stream = BlockTemplateStream::from_templates(vec![template.clone()]);
        assert_eq!(stream.next().await, Some(template));
        assert_eq!(stream.next().await, None);
    }
}
