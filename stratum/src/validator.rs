//! Share Validation
//!
//! On each `mining.submit` the candidate header is reconstructed with
//! the session's graffiti and the solver's randomness, deduplicated,
//! hashed through the opaque kernel, and classified: a hash inside the
//! network target is forwarded upstream as a full block, a hash inside
//! the pool target is credited as a share, and everything else is
//! dropped. Apart from the upstream `submitBlock` call and the share
//! store write, validation is pure.

use std::sync::Arc;

use log::{debug, info, warn};

use lodepool_consensus::{HeaderHasher, Target};
use lodepool_core::RANDOMNESS_LEN;
use lodepool_database::ShareStore;
use lodepool_rpc::NodeClient;

use crate::messages::SubmitBody;
use crate::server::ClientSession;
use crate::{StratumError, WorkDistributor};

/// Disposition of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Work id is not the current one
    Stale { submitted: u32 },

    /// Work id fell out of the recent-request cache
    UnknownRequest { submitted: u32 },

    /// Randomness is not 8 bytes of hex
    InvalidRandomness,

    /// This session already submitted this randomness for this work
    Duplicate,

    /// The candidate header could not be reconstructed
    InvalidHeader,

    /// The hash met neither the network nor the pool target
    AboveTarget,

    /// The hash met at least one target
    Accepted {
        /// The network target was met and the block forwarded upstream
        block: bool,
        /// The pool target was met and a share recorded
        share: bool,
    },
}

/// Validates submissions against the distributor's current work
pub struct SubmissionProcessor {
    distributor: Arc<WorkDistributor>,
    node: Arc<dyn NodeClient>,
    store: Arc<ShareStore>,
    hasher: Arc<dyn HeaderHasher>,
    pool_target: Target,
}

impl SubmissionProcessor {
    pub fn new(
        distributor: Arc<WorkDistributor>,
        node: Arc<dyn NodeClient>,
        store: Arc<ShareStore>,
        hasher: Arc<dyn HeaderHasher>,
        pool_target: Target,
    ) -> Self {
        SubmissionProcessor {
            distributor,
            node,
            store,
            hasher,
            pool_target,
        }
    }

    /// The share target submissions are judged against
    pub fn pool_target(&self) -> Target {
        self.pool_target
    }

    /// Classify one submission, forwarding blocks and recording shares
    pub async fn process(
        &self,
        session: &ClientSession,
        submit: &SubmitBody,
    ) -> Result<SubmissionOutcome, StratumError> {
        let mining_request_id = submit.mining_request_id;

        if self.distributor.current_mining_request_id() != Some(mining_request_id) {
            debug!(
                "Client {} submitted stale work for request {}",
                session.id(),
                mining_request_id
            );
            return Ok(SubmissionOutcome::Stale {
                submitted: mining_request_id,
            });
        }

        let template = match self.distributor.template_for(mining_request_id) {
            Some(template) => template,
            None => {
                warn!(
                    "Client {} submitted work for unknown request {}",
                    session.id(),
                    mining_request_id
                );
                return Ok(SubmissionOutcome::UnknownRequest {
                    submitted: mining_request_id,
                });
            }
        };

        let randomness = match lodepool_util::hex_to_array::<RANDOMNESS_LEN>(&submit.randomness) {
            Ok(randomness) => randomness,
            Err(_) => return Ok(SubmissionOutcome::InvalidRandomness),
        };

        if !session.register_submission(mining_request_id, &submit.randomness) {
            warn!(
                "Client {} repeated randomness {} for request {}",
                session.id(),
                submit.randomness,
                mining_request_id
            );
            return Ok(SubmissionOutcome::Duplicate);
        }

        let graffiti = session.graffiti().unwrap_or_default();
        let public_address = session.public_address().unwrap_or_default();

        let mut header = match template.mineable_header() {
            Ok(header) => header,
            Err(e) => {
                warn!("Header reconstruction failed for client {}: {}", session.id(), e);
                return Ok(SubmissionOutcome::InvalidHeader);
            }
        };
        header.randomness = randomness;
        if header.set_graffiti_str(&graffiti).is_err() {
            warn!("Graffiti splice failed for client {}", session.id());
            return Ok(SubmissionOutcome::InvalidHeader);
        }

        let hash = self.hasher.hash_header(&header.serialize());
        let network_target = Target::from_hex(&template.header.target)?;

        let mut block = false;
        if network_target.meets(&hash) {
            info!(
                "Client {} found a block at sequence {}",
                session.id(),
                header.sequence
            );

            let mut mined = template.clone();
            mined.header.randomness = hex::encode(randomness);
            mined.header.graffiti = hex::encode(header.graffiti);

            block = true;
            match self.node.submit_block(&mined).await {
                Ok(result) if result.added => {
                    info!("Block at sequence {} accepted upstream", header.sequence);
                    // Credit the block so the payout engine can track
                    // its confirmation and fund the period.
                    self.store
                        .new_block(header.sequence, &hex::encode(hash), template.miner_reward)
                        .await?;
                }
                Ok(result) => {
                    info!(
                        "Block at sequence {} rejected upstream: {}",
                        header.sequence,
                        result.reason.as_deref().unwrap_or("no reason given")
                    );
                }
                Err(e) => {
                    warn!("Block submission failed: {}", e);
                }
            }
        }

        let mut share = false;
        if self.pool_target.meets(&hash) {
            self.store.new_share(&public_address).await?;
            share = true;
            debug!("Share credited to {}", public_address);
        }

        if !block && !share {
            return Ok(SubmissionOutcome::AboveTarget);
        }

        Ok(SubmissionOutcome::Accepted { block, share })
    }
}
