//! Work Distributor
//!
//! Consumes the block template stream from the upstream node, assigns
//! each distributed template a monotonically increasing mining request
//! id, keeps a bounded cache of recent requests for stale-work
//! identification, and periodically re-derives the proof-of-work
//! target as wall clock advances. New work is handed to the server's
//! broadcast loop over an owned channel.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use num_bigint::BigUint;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};

use lodepool_consensus::{calculate_difficulty, ConsensusParameters, Target};
use lodepool_core::{BlockTemplate, MiningRequest, MiningRequestCache};
use lodepool_rpc::NodeClient;

use crate::StratumError;

/// How often the target is re-derived between templates
pub const RECALCULATE_INTERVAL: Duration = Duration::from_secs(10);

/// Delay between reconnection attempts to the upstream node
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Work events handed to the server's broadcast loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkBroadcast {
    /// Fresh work for all subscribed clients
    NewWork {
        mining_request_id: u32,
        header: String,
    },

    /// The upstream node is gone; miners should pause
    WaitForWork,
}

struct DistributorState {
    next_mining_request_id: u32,
    current: Option<MiningRequest>,
    cache: MiningRequestCache,
    head_difficulty: BigUint,
    head_timestamp_ms: i64,
}

/// Owner of the current mining request id, the template cache, and the
/// target-recompute timer
pub struct WorkDistributor {
    state: Mutex<DistributorState>,
    params: ConsensusParameters,
    broadcast_tx: mpsc::UnboundedSender<WorkBroadcast>,
}

impl WorkDistributor {
    pub fn new(
        params: ConsensusParameters,
        broadcast_tx: mpsc::UnboundedSender<WorkBroadcast>,
    ) -> Self {
        let min_difficulty = BigUint::from(params.min_difficulty);
        WorkDistributor {
            state: Mutex::new(DistributorState {
                next_mining_request_id: 0,
                current: None,
                cache: MiningRequestCache::new(),
                head_difficulty: min_difficulty,
                head_timestamp_ms: 0,
            }),
            params,
            broadcast_tx,
        }
    }

    /// Id of the work currently being distributed
    pub fn current_mining_request_id(&self) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.current.as_ref().map(|request| request.id)
    }

    /// Template for a recently distributed request id
    pub fn template_for(&self, mining_request_id: u32) -> Option<BlockTemplate> {
        let state = self.state.lock().unwrap();
        state.cache.get(mining_request_id).cloned()
    }

    /// Current work as a notify payload for a fresh subscriber
    pub fn current_work(&self) -> Option<(u32, String)> {
        let state = self.state.lock().unwrap();
        let request = state.current.as_ref()?;
        let header = request.template.mineable_header().ok()?;
        Some((request.id, hex::encode(header.serialize())))
    }

    /// Ingest one template from the upstream stream
    pub fn process_template(&self, template: BlockTemplate) -> Result<(), StratumError> {
        // Reject undecodable templates before taking an id for them.
        let header = template.mineable_header()?;

        let (mining_request_id, header_hex) = {
            let mut state = self.state.lock().unwrap();

            if let Some(info) = &template.previous_block_info {
                state.head_difficulty = Target::from_hex(&info.target)?.to_difficulty();
                state.head_timestamp_ms = info.timestamp;
            }

            let mining_request_id = state.next_mining_request_id;
            state.next_mining_request_id += 1;
            state.cache.insert(mining_request_id, template.clone());
            state.current = Some(MiningRequest {
                id: mining_request_id,
                template,
            });

            (mining_request_id, hex::encode(header.serialize()))
        };

        debug!(
            "New work: mining request {} at sequence {}",
            mining_request_id, header.sequence
        );
        let _ = self.broadcast_tx.send(WorkBroadcast::NewWork {
            mining_request_id,
            header: header_hex,
        });
        Ok(())
    }

    /// Re-derive the target for the present moment. Returns whether new
    /// work was distributed; an unchanged target keeps the miners
    /// searching their current space.
    pub fn recompute_target(&self, now_ms: i64) -> Result<bool, StratumError> {
        let (mining_request_id, header_hex) = {
            let mut state = self.state.lock().unwrap();
            let current = match &state.current {
                Some(request) => request,
                None => return Ok(false),
            };

            let new_difficulty = calculate_difficulty(
                &self.params,
                current.template.header.sequence,
                now_ms,
                state.head_timestamp_ms,
                &state.head_difficulty,
            );
            let new_target = Target::from_difficulty(&new_difficulty);
            let current_target = Target::from_hex(&current.template.header.target)?;

            if new_target == current_target {
                return Ok(false);
            }

            let mut template = current.template.clone();
            template.header.target = new_target.to_hex();
            template.header.timestamp = now_ms;
            let header = template.mineable_header()?;

            let mining_request_id = state.next_mining_request_id;
            state.next_mining_request_id += 1;
            state.cache.insert(mining_request_id, template.clone());
            state.current = Some(MiningRequest {
                id: mining_request_id,
                template,
            });

            (mining_request_id, hex::encode(header.serialize()))
        };

        debug!("Retargeted work: mining request {}", mining_request_id);
        let _ = self.broadcast_tx.send(WorkBroadcast::NewWork {
            mining_request_id,
            header: header_hex,
        });
        Ok(true)
    }

    /// Drive the template stream until stopped, reconnecting with a
    /// fixed delay and pausing miners while the node is unreachable
    pub async fn run(self: Arc<Self>, node: Arc<dyn NodeClient>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }

            match node.block_template_stream().await {
                Ok(mut stream) => {
                    info!("Consuming block templates from the upstream node");
                    let start = Instant::now() + RECALCULATE_INTERVAL;
                    let mut recompute = interval_at(start, RECALCULATE_INTERVAL);

                    loop {
                        tokio::select! {
                            template = stream.next() => match template {
                                Some(template) => {
                                    recompute.reset();
                                    if let Err(e) = self.process_template(template) {
                                        warn!("Dropping undecodable template: {}", e);
                                    }
                                }
                                None => break,
                            },
                            _ = recompute.tick() => {
                                if let Err(e) = self.recompute_target(lodepool_util::now_ms()) {
                                    warn!("Target recomputation failed: {}", e);
                                }
                            }
                            changed = stop.changed() => {
                                if changed.is_err() || *stop.borrow() {
                                    return;
                                }
                            }
                        }
                    }

                    warn!("Upstream node disconnected");
                }
                Err(e) => {
                    warn!("Upstream node unavailable: {}", e);
                }
            }

            if *stop.borrow() {
                break;
            }

            let _ = self.broadcast_tx.send(WorkBroadcast::WaitForWork);

            // Fixed-delay reconnect loop.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
                if node.try_connect().await {
                    info!("Reconnected to the upstream node");
                    break;
                }
            }
        }
    }
}
