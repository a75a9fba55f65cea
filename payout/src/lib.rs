//! Payout Engine for lodepool
//!
//! Periodically rolls shares into time-bounded payout periods,
//! reconciles the chain status of pool-credited blocks and payout
//! transactions against the upstream node, and settles the oldest
//! outstanding period once every block funding it has confirmed.
//! Payment is proportional to share count with a flat one-unit fee
//! per recipient. An expired payout transaction releases its shares,
//! re-opening the period for the next attempt.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use lodepool_database::{ShareStore, StoreError};
use lodepool_rpc::{
    NodeClient, RpcError, SendTransactionRequest, TransactionOutput, NATIVE_ASSET_ID,
};

/// How often the engine wakes up
pub const PAYOUT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Payout engine errors
#[derive(Debug, Error)]
pub enum PayoutError {
    /// Share store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Upstream node error
    #[error("Node error: {0}")]
    Rpc(#[from] RpcError),

    /// The node reported a balance the engine cannot parse
    #[error("Invalid balance: {0}")]
    InvalidBalance(String),

    /// Split arithmetic produced more than the period's reward
    #[error("Payout split exceeds the period reward")]
    RewardOverflow,
}

/// Engine configuration, a narrow slice of the pool configuration
#[derive(Debug, Clone)]
pub struct PayoutConfig {
    /// Pool name, embedded in payout memos
    pub pool_name: String,

    /// Node wallet account payouts are sent from
    pub account_name: Option<String>,

    /// Payout period length in seconds
    pub payout_period_duration: u64,

    /// Sequences until a payout transaction expires unconfirmed
    pub transaction_expiration_delta: u32,
}

/// The periodic settlement loop over the share store
pub struct PayoutEngine {
    store: Arc<ShareStore>,
    node: Arc<dyn NodeClient>,
    config: PayoutConfig,
}

impl PayoutEngine {
    pub fn new(store: Arc<ShareStore>, node: Arc<dyn NodeClient>, config: PayoutConfig) -> Self {
        PayoutEngine {
            store,
            node,
            config,
        }
    }

    /// Tick until stopped. A failing tick is logged and retried at the
    /// next interval; the store is left consistent either way.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(PAYOUT_TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(lodepool_util::now_ms()).await {
                        error!("Payout tick failed: {}", e);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Payout engine stopped");
    }

    /// One full pass: rollover, reconciliation, settlement
    pub async fn tick(&self, now_ms: i64) -> Result<(), PayoutError> {
        self.rollover_if_due(now_ms).await?;
        self.reconcile_transactions().await?;
        self.reconcile_blocks().await?;
        self.construct_payout().await?;
        Ok(())
    }

    /// Close the current payout period once it has run its duration
    async fn rollover_if_due(&self, now_ms: i64) -> Result<(), PayoutError> {
        let duration_ms = (self.config.payout_period_duration as i64).saturating_mul(1000);

        if let Some(period) = self.store.current_payout_period().await? {
            if period.start_ms > now_ms - duration_ms {
                return Ok(());
            }
        }

        self.store.rollover_payout_period(now_ms).await?;
        Ok(())
    }

    /// Pull confirmed/expired status for in-flight payout transactions.
    /// An expired transaction releases its shares so the period becomes
    /// outstanding again.
    async fn reconcile_transactions(&self) -> Result<(), PayoutError> {
        for transaction in self.store.unconfirmed_transactions().await? {
            let status = match self.node.get_transaction_status(&transaction.hash).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        "Status lookup for transaction {} failed: {}",
                        transaction.hash, e
                    );
                    continue;
                }
            };

            if status.confirmed && status.expired {
                warn!(
                    "Node reported transaction {} as both confirmed and expired; ignoring",
                    transaction.hash
                );
                continue;
            }

            self.store
                .update_transaction_status(transaction.id, status.confirmed, status.expired)
                .await?;

            if status.expired && !status.confirmed {
                info!(
                    "Payout transaction {} expired; releasing its shares",
                    transaction.hash
                );
                self.store.mark_shares_unpaid(transaction.id).await?;
            }
        }
        Ok(())
    }

    /// Pull main/confirmed status for pool-credited blocks
    async fn reconcile_blocks(&self) -> Result<(), PayoutError> {
        for block in self.store.unconfirmed_blocks().await? {
            let info = match self.node.get_block_info(&block.hash).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Status lookup for block {} failed: {}", block.hash, e);
                    continue;
                }
            };

            self.store
                .update_block_status(block.id, info.main, info.confirmed)
                .await?;
        }
        Ok(())
    }

    /// Settle the oldest outstanding period if every block funding it
    /// has confirmed and the wallet can cover the payment
    async fn construct_payout(&self) -> Result<(), PayoutError> {
        let period = match self.store.earliest_outstanding_payout_period().await? {
            Some(period) => period,
            None => return Ok(()),
        };

        if !self.store.payout_period_blocks_confirmed(period.id).await? {
            debug!("Period {} still has unconfirmed blocks", period.id);
            return Ok(());
        }

        let addresses = self.store.payout_addresses(period.id).await?;
        if addresses.is_empty() {
            // Every share is attached to an in-flight transaction.
            return Ok(());
        }
        let total_shares: u64 = addresses.iter().map(|a| a.share_count).sum();

        let total_reward = self.store.payout_reward(period.id).await?;
        let fee = addresses.len() as u64;
        if total_reward <= fee {
            info!(
                "Period {} reward {} cannot cover a payout; deleting its shares",
                period.id, total_reward
            );
            self.store.delete_unpayable_shares(period.id).await?;
            return Ok(());
        }

        let amount_per_share = (total_reward - fee) / total_shares;
        if amount_per_share == 0 {
            info!(
                "Period {} reward {} rounds to nothing over {} shares; deleting its shares",
                period.id, total_reward, total_shares
            );
            self.store.delete_unpayable_shares(period.id).await?;
            return Ok(());
        }

        let required = amount_per_share
            .checked_mul(total_shares)
            .and_then(|amount| amount.checked_add(fee))
            .ok_or(PayoutError::RewardOverflow)?;
        if required > total_reward {
            return Err(PayoutError::RewardOverflow);
        }

        let balance = self
            .node
            .get_account_balance(self.config.account_name.as_deref())
            .await?;
        let available: u64 = balance
            .available
            .parse()
            .map_err(|_| PayoutError::InvalidBalance(balance.available.clone()))?;
        if available < required {
            info!(
                "Period {} needs {} but only {} is available; retrying later",
                period.id, required, available
            );
            return Ok(());
        }

        let outputs: Vec<TransactionOutput> = addresses
            .iter()
            .map(|address| TransactionOutput {
                public_address: address.public_address.clone(),
                amount: amount_per_share * address.share_count,
                memo: format!("{} payout {}", self.config.pool_name, period.id),
                asset_id: NATIVE_ASSET_ID.to_string(),
            })
            .collect();

        let request = SendTransactionRequest {
            account: self.config.account_name.clone(),
            outputs,
            fee,
            expiration_delta: Some(self.config.transaction_expiration_delta),
        };

        match self.node.send_transaction(&request).await {
            Ok(response) => {
                let transaction_id = self.store.new_transaction(&response.hash, period.id).await?;
                let names: Vec<String> = addresses
                    .iter()
                    .map(|address| address.public_address.clone())
                    .collect();
                self.store
                    .mark_shares_paid(period.id, transaction_id, &names)
                    .await?;
                info!(
                    "Paid period {}: {} to {} addresses in transaction {}",
                    period.id,
                    required,
                    names.len(),
                    response.hash
                );
            }
            Err(e) => {
                // The period stays outstanding; the next tick retries.
                warn!("Payout for period {} failed: {}", period.id, e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use lodepool_rpc::{
        AccountBalance, BlockInfo, BlockTemplateStream, SendTransactionResponse,
        SubmitBlockResult, TransactionStatusInfo,
    };

    #[derive(Default)]
    struct MockNode {
        available: Mutex<String>,
        sent: Mutex<Vec<SendTransactionRequest>>,
        transaction_status: Mutex<HashMap<String, TransactionStatusInfo>>,
        block_info: Mutex<HashMap<String, BlockInfo>>,
    }

    impl MockNode {
        fn with_balance(available: &str) -> Self {
            let node = MockNode::default();
            *node.available.lock().unwrap() = available.to_string();
            node
        }

        fn set_balance(&self, available: &str) {
            *self.available.lock().unwrap() = available.to_string();
        }

        fn set_block(&self, hash: &str, main: bool, confirmed: bool) {
            self.block_info
                .lock()
                .unwrap()
                .insert(hash.to_string(), BlockInfo { main, confirmed });
        }

        fn set_transaction(&self, hash: &str, confirmed: bool, expired: bool) {
            self.transaction_status
                .lock()
                .unwrap()
                .insert(hash.to_string(), TransactionStatusInfo { confirmed, expired });
        }
    }

    #[async_trait]
    impl NodeClient for MockNode {
        async fn block_template_stream(&self) -> Result<BlockTemplateStream, RpcError> {
            Ok(BlockTemplateStream::from_templates(Vec::new()))
        }

        async fn submit_block(
            &self,
            _template: &lodepool_core::BlockTemplate,
        ) -> Result<SubmitBlockResult, RpcError> {
            unimplemented!("not used by the payout engine")
        }

        async fn get_account_balance(
            &self,
            _account: Option<&str>,
        ) -> Result<AccountBalance, RpcError> {
            let available = self.available.lock().unwrap().clone();
            Ok(AccountBalance {
                confirmed: available.clone(),
                available,
            })
        }

        async fn send_transaction(
            &self,
            request: &SendTransactionRequest,
        ) -> Result<SendTransactionResponse, RpcError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(request.clone());
            Ok(SendTransactionResponse {
                hash: format!("payout-{}", sent.len()),
            })
        }

        async fn get_consensus_parameters(
            &self,
        ) -> Result<lodepool_consensus::ConsensusParameters, RpcError> {
            unimplemented!("not used by the payout engine")
        }

        async fn get_block_info(&self, hash: &str) -> Result<BlockInfo, RpcError> {
            self.block_info
                .lock()
                .unwrap()
                .get(hash)
                .copied()
                .ok_or_else(|| RpcError::Node(format!("unknown block {}", hash)))
        }

        async fn get_transaction_status(
            &self,
            hash: &str,
        ) -> Result<TransactionStatusInfo, RpcError> {
            self.transaction_status
                .lock()
                .unwrap()
                .get(hash)
                .copied()
                .ok_or_else(|| RpcError::Node(format!("unknown transaction {}", hash)))
        }

        async fn try_connect(&self) -> bool {
            true
        }
    }

    fn config() -> PayoutConfig {
        PayoutConfig {
            pool_name: "lodepool".to_string(),
            account_name: None,
            payout_period_duration: 3600,
            transaction_expiration_delta: 30,
        }
    }

    async fn seeded_store() -> Arc<ShareStore> {
        let store = Arc::new(ShareStore::open_in_memory().await.unwrap());
        for _ in 0..10 {
            store.new_share("lode_alice").await.unwrap();
        }
        for _ in 0..5 {
            store.new_share("lode_bob").await.unwrap();
        }
        store.new_block(100, "block-1", 1_000_000).await.unwrap();
        store
    }

    fn due(now_offset_periods: i64) -> i64 {
        lodepool_util::now_ms() + now_offset_periods * 3600 * 1000 + 1_000
    }

    #[tokio::test]
    async fn test_payout_lifecycle() {
        let store = seeded_store().await;
        let node = Arc::new(MockNode::with_balance("2000000"));
        node.set_block("block-1", true, true);
        let engine = PayoutEngine::new(store.clone(), node.clone(), config());

        let period = store.current_payout_period().await.unwrap().unwrap();
        engine.tick(due(1)).await.unwrap();

        // One transaction: (1_000_000 - 2) / 15 = 66_666 per share.
        let sent = node.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].fee, 2);
        assert_eq!(sent[0].expiration_delta, Some(30));
        assert_eq!(sent[0].outputs.len(), 2);

        let alice = sent[0]
            .outputs
            .iter()
            .find(|o| o.public_address == "lode_alice")
            .unwrap();
        let bob = sent[0]
            .outputs
            .iter()
            .find(|o| o.public_address == "lode_bob")
            .unwrap();
        assert_eq!(alice.amount, 666_660);
        assert_eq!(bob.amount, 333_330);
        assert_eq!(alice.memo, format!("lodepool payout {}", period.id));
        assert_eq!(alice.asset_id, NATIVE_ASSET_ID);

        // All 15 shares are attached to the transaction.
        assert!(store.shares_pending_payout(None).await.unwrap().is_empty());

        // The period stays outstanding until the transaction confirms.
        assert_eq!(
            store
                .earliest_outstanding_payout_period()
                .await
                .unwrap()
                .unwrap()
                .id,
            period.id
        );

        node.set_transaction("payout-1", true, false);
        engine.tick(due(1)).await.unwrap();

        assert!(store
            .earliest_outstanding_payout_period()
            .await
            .unwrap()
            .is_none());
        // No second payment was attempted.
        assert_eq!(node.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_transaction_reopens_period() {
        let store = seeded_store().await;
        let node = Arc::new(MockNode::with_balance("2000000"));
        node.set_block("block-1", true, true);
        let engine = PayoutEngine::new(store.clone(), node.clone(), config());

        let period = store.current_payout_period().await.unwrap().unwrap();
        engine.tick(due(1)).await.unwrap();
        assert_eq!(node.sent.lock().unwrap().len(), 1);

        // The transaction expires unconfirmed. Drain the balance so the
        // retry cannot fire inside the same tick.
        node.set_transaction("payout-1", false, true);
        node.set_balance("0");
        engine.tick(due(1)).await.unwrap();

        assert_eq!(store.shares_pending_payout(None).await.unwrap().len(), 15);
        assert_eq!(
            store
                .earliest_outstanding_payout_period()
                .await
                .unwrap()
                .unwrap()
                .id,
            period.id
        );

        // With funds back, the next tick pays the period again.
        node.set_balance("2000000");
        engine.tick(due(1)).await.unwrap();
        assert_eq!(node.sent.lock().unwrap().len(), 2);
        assert!(store.shares_pending_payout(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_blocks_defer_payout() {
        let store = seeded_store().await;
        let node = Arc::new(MockNode::with_balance("2000000"));
        node.set_block("block-1", true, false);
        let engine = PayoutEngine::new(store.clone(), node.clone(), config());

        engine.tick(due(1)).await.unwrap();
        assert!(node.sent.lock().unwrap().is_empty());

        // Once the block confirms, the next tick settles the period.
        node.set_block("block-1", true, true);
        engine.tick(due(1)).await.unwrap();
        assert_eq!(node.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_reward_deletes_unpayable_shares() {
        let store = Arc::new(ShareStore::open_in_memory().await.unwrap());
        store.new_share("lode_alice").await.unwrap();
        store.new_block(100, "block-1", 1_000).await.unwrap();
        let period = store.current_payout_period().await.unwrap().unwrap();

        let node = Arc::new(MockNode::with_balance("2000000"));
        // A forked block contributes nothing to the reward.
        node.set_block("block-1", false, true);
        let engine = PayoutEngine::new(store.clone(), node.clone(), config());

        engine.tick(due(1)).await.unwrap();
        assert!(node.sent.lock().unwrap().is_empty());
        assert_eq!(store.payout_period_share_count(period.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leave_period_outstanding() {
        let store = seeded_store().await;
        let node = Arc::new(MockNode::with_balance("10"));
        node.set_block("block-1", true, true);
        let engine = PayoutEngine::new(store.clone(), node.clone(), config());

        let period = store.current_payout_period().await.unwrap().unwrap();
        engine.tick(due(1)).await.unwrap();

        assert!(node.sent.lock().unwrap().is_empty());
        assert_eq!(
            store
                .earliest_outstanding_payout_period()
                .await
                .unwrap()
                .unwrap()
                .id,
            period.id
        );
    }

    #[tokio::test]
    async fn test_rollover_within_duration_is_noop() {
        let store = Arc::new(ShareStore::open_in_memory().await.unwrap());
        store.new_share("lode_alice").await.unwrap();
        let period = store.current_payout_period().await.unwrap().unwrap();

        let node = Arc::new(MockNode::with_balance("0"));
        let engine = PayoutEngine::new(store.clone(), node, config());

        // Well inside the period duration: no rollover happens.
        engine.tick(lodepool_util::now_ms()).await.unwrap();
        assert_eq!(
            store.current_payout_period().await.unwrap().unwrap().id,
            period.id
        );
    }
}
