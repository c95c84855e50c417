//! The long-lived task driving the packer: wait for sync, schedule, sleep
//! to the slot, adopt mempool transactions, pack, hand the block to the
//! committer and learn from the outcome.

use crate::bandwidth::Bandwidth;
use crate::flow::{AdoptError, Flow};
use crate::packer::{Packer, ScheduleError};
use anyhow::{anyhow, Context, Result};
use secp256k1::SecretKey;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thorium_network::PeerNet;
use thorium_state::Stage;
use thorium_storage::{BlockSummary, ChainRepository};
use thorium_txpool::TxPool;
use thorium_types::constants::GAS_LIMIT_SOFT_LIMIT;
use thorium_types::{Block, ForkConfig, Receipt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

/// A locally packed block on its way to the committer. The sender blocks on
/// `ack` so no new flow starts on a stale parent.
pub struct PackedEvent {
    pub block: Arc<Block>,
    pub stage: Stage,
    pub receipts: Vec<Receipt>,
    pub ack: oneshot::Sender<()>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackMode {
    /// Full PoA scheduling.
    Consensus,
    /// Mock flows on a fixed cadence, outside PoA.
    Solo,
}

#[derive(Clone, Debug)]
pub struct PackerLoopOptions {
    pub mode: PackMode,
    pub block_interval: u64,
    /// True when `target_gas_limit` was 0: pull suggestions from the
    /// bandwidth estimator before every schedule.
    pub adaptive_gas_limit: bool,
    /// Solo-mode block gas limit; 0 inherits the parent's.
    pub solo_gas_limit: u64,
}

pub struct PackerLoop {
    packer: Arc<Packer>,
    repo: Arc<ChainRepository>,
    pool: Arc<TxPool>,
    net: Arc<dyn PeerNet>,
    bandwidth: Arc<Bandwidth>,
    key: SecretKey,
    fork: ForkConfig,
    options: PackerLoopOptions,
    packed_tx: mpsc::Sender<PackedEvent>,
}

impl PackerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        packer: Arc<Packer>,
        repo: Arc<ChainRepository>,
        pool: Arc<TxPool>,
        net: Arc<dyn PeerNet>,
        bandwidth: Arc<Bandwidth>,
        key: SecretKey,
        fork: ForkConfig,
        options: PackerLoopOptions,
        packed_tx: mpsc::Sender<PackedEvent>,
    ) -> Self {
        Self {
            packer,
            repo,
            pool,
            net,
            bandwidth,
            key,
            fork,
            options,
            packed_tx,
        }
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut synced = self.net.synced();
        while !*synced.borrow() {
            tokio::select! {
                _ = cancel.changed() => return Ok(()),
                changed = synced.changed() => {
                    changed.map_err(|_| anyhow!("sync signal dropped"))?;
                }
            }
        }
        info!("synced, packer loop running");

        let mut best_events = self.repo.subscribe_best();
        let mut able_to_pack = true;

        'outer: loop {
            if *cancel.borrow() {
                break;
            }
            let best = self.repo.best_block_summary();
            if self.options.adaptive_gas_limit {
                self.packer.set_target_gas_limit(
                    self.bandwidth
                        .suggest_gas_limit()
                        .min(GAS_LIMIT_SOFT_LIMIT),
                );
            }

            let mut flow = match self.build_flow(&best) {
                Ok(flow) => flow,
                Err(ScheduleError::NotScheduled) => {
                    if able_to_pack {
                        warn!(parent = %best.id(), "unable to pack");
                        able_to_pack = false;
                    }
                    tokio::select! {
                        _ = cancel.changed() => break,
                        _ = best_events.recv() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
                Err(e) => return Err(e).context("scheduling failed"),
            };
            if !able_to_pack {
                able_to_pack = true;
                info!(when = flow.when(), "prepared to pack");
            }

            // Wake early enough to fill the block before its slot.
            let offset = if flow.number() >= self.fork.vip193 {
                self.options.block_interval
            } else {
                self.options.block_interval / 2
            };
            let wake_at = flow.when().saturating_sub(offset);
            loop {
                tokio::select! {
                    _ = cancel.changed() => break 'outer,
                    event = best_events.recv() => {
                        let Some(new_best) = event else { break 'outer };
                        if self.should_reschedule(&new_best, &flow) {
                            continue 'outer;
                        }
                    }
                    _ = tokio::time::sleep(until(wake_at)) => break,
                }
            }

            self.adopt_txs(&mut flow);

            loop {
                tokio::select! {
                    _ = cancel.changed() => break 'outer,
                    event = best_events.recv() => {
                        let Some(new_best) = event else { break 'outer };
                        if self.should_reschedule(&new_best, &flow) {
                            continue 'outer;
                        }
                    }
                    _ = tokio::time::sleep(until(flow.when())) => break,
                }
            }

            let started = Instant::now();
            let (block, stage, receipts) = flow
                .pack(&self.key)
                .context("packing with the master key")?;
            let header = block.header().clone();
            let (ack, acked) = oneshot::channel();
            let event = PackedEvent {
                block: Arc::new(block),
                stage,
                receipts,
                ack,
            };
            if self.packed_tx.send(event).await.is_err() {
                break;
            }
            if acked.await.is_err() {
                break;
            }
            let elapsed = started.elapsed();
            let (gps, updated) = self.bandwidth.update(&header, elapsed);
            if updated {
                info!(gps, "bandwidth updated");
            }
        }
        info!("packer loop stopped");
        Ok(())
    }

    fn build_flow(&self, best: &BlockSummary) -> std::result::Result<Flow, ScheduleError> {
        match self.options.mode {
            PackMode::Consensus => self.packer.schedule(best, now_unix()),
            PackMode::Solo => {
                let interval = self.options.block_interval;
                let parent_time = best.header.timestamp;
                let now = now_unix();
                let slots = if now > parent_time {
                    (now - parent_time).div_ceil(interval).max(1)
                } else {
                    1
                };
                let gas_limit = if self.options.solo_gas_limit == 0 {
                    best.header.gas_limit
                } else {
                    self.options.solo_gas_limit
                };
                self.packer
                    .mock(best, parent_time + slots * interval, gas_limit)
            }
        }
    }

    fn should_reschedule(&self, new_best: &BlockSummary, flow: &Flow) -> bool {
        // A stale event confirming the flow's own parent changes nothing.
        if new_best.id() == flow.parent_id() {
            return false;
        }
        new_best.header.parent_id != flow.parent_id()
            || (flow.number() < self.fork.vip193
                && new_best.header.total_score > flow.total_score())
    }

    /// Fills the flow from the executables snapshot, bounded by the slot
    /// deadline.
    fn adopt_txs(&self, flow: &mut Flow) {
        let deadline = flow.when();
        for tx in self.pool.executables() {
            if now_unix() >= deadline {
                break;
            }
            let id = match tx.id() {
                Ok(id) => id,
                Err(_) => continue,
            };
            match flow.adopt(&tx) {
                Ok(()) => {}
                Err(AdoptError::GasLimitReached) => break,
                Err(AdoptError::NotAdoptableNow) | Err(AdoptError::KnownTx) => {}
                Err(AdoptError::BadTx(reason)) => {
                    warn!(tx = %id, reason, "dropping bad tx from pool");
                    self.pool.remove(id);
                }
                Err(AdoptError::NotAdoptableForever) => {
                    self.pool.remove(id);
                }
                Err(AdoptError::Internal(e)) => {
                    error!(error = %e, "adoption aborted");
                    break;
                }
            }
        }
        info!(
            number = flow.number(),
            txs = flow.tx_count(),
            gas_used = flow.gas_used(),
            "txs adopted"
        );
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn until(target: u64) -> Duration {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Duration::from_millis((target * 1_000).saturating_sub(now_ms))
}
