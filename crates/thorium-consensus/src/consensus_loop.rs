//! The long-lived task absorbing peer and locally packed blocks: validate,
//! buffer the early and the orphaned, commit the rest.

use crate::commit::{CommitOutcome, Committer};
use crate::future_heap::FutureHeap;
use crate::orphan_map::OrphanMap;
use crate::validator::{Consensus, ValidationError};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thorium_network::PeerNet;
use thorium_packer::PackedEvent;
use thorium_storage::ChainRepository;
use thorium_types::Block;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub struct ConsensusLoop {
    repo: Arc<ChainRepository>,
    validator: Consensus,
    committer: Committer,
    net: Arc<dyn PeerNet>,
    packed_rx: mpsc::Receiver<PackedEvent>,
    block_interval: u64,
    future: FutureHeap,
    orphans: OrphanMap,
    /// Orphan descendants released one per iteration.
    pending: VecDeque<Arc<Block>>,
}

impl ConsensusLoop {
    pub fn new(
        repo: Arc<ChainRepository>,
        validator: Consensus,
        committer: Committer,
        net: Arc<dyn PeerNet>,
        packed_rx: mpsc::Receiver<PackedEvent>,
        block_interval: u64,
    ) -> Self {
        Self {
            repo,
            validator,
            committer,
            net,
            packed_rx,
            block_interval,
            future: FutureHeap::new(),
            orphans: OrphanMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut peer_blocks = self.net.subscribe_block();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.block_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("consensus loop running");

        loop {
            // Orphans released by an earlier commit re-enter here, one
            // generation per iteration.
            if let Some(block) = self.pending.pop_front() {
                self.process_block(block, now_unix())?;
                continue;
            }

            tokio::select! {
                _ = cancel.changed() => break,
                _ = ticker.tick() => {
                    let now = now_unix();
                    if let Some(block) = self.future.pop_expired(now) {
                        self.process_block(block, now)?;
                    }
                    self.orphans.sweep(now);
                }
                event = peer_blocks.recv() => {
                    let Some(event) = event else { break };
                    self.process_block(event.block, now_unix())?;
                }
                packed = self.packed_rx.recv() => {
                    let Some(packed) = packed else { break };
                    self.commit_packed(packed)?;
                }
            }
        }

        peer_blocks.unsubscribe();
        info!("consensus loop stopped");
        Ok(())
    }

    /// Validates and, on success, commits one block, releasing a waiting
    /// orphan child into the pending queue.
    fn process_block(&mut self, block: Arc<Block>, now: u64) -> Result<()> {
        let id = block.id();
        if self.repo.contains_block(id)? {
            return Ok(());
        }
        let Some(parent) = self.repo.get_block_summary(block.header().parent_id)? else {
            self.orphans.insert(block.header().parent_id, block, now);
            return Ok(());
        };

        match self.validator.process(&parent, &block, now) {
            Ok((stage, receipts)) => {
                self.committer
                    .commit_block(block, Some(stage), receipts)
                    .context("committing peer block")?;
                if let Some(child) = self.orphans.take(id) {
                    self.pending.push_back(child);
                }
            }
            Err(ValidationError::FutureBlock) => {
                if !self.future.contains(id) {
                    self.future.push(block);
                }
            }
            Err(ValidationError::Invalid(reason)) => {
                warn!(block = %id, reason, "block rejected");
            }
            Err(ValidationError::Internal(e)) => {
                return Err(anyhow::anyhow!(e)).context("validating peer block");
            }
        }
        Ok(())
    }

    /// A locally packed block needs trunk classification only; validation
    /// already happened inside the flow.
    fn commit_packed(&mut self, packed: PackedEvent) -> Result<()> {
        let id = packed.block.id();
        let outcome = self
            .committer
            .commit_block(packed.block, Some(packed.stage), packed.receipts)
            .context("committing packed block")?;
        if outcome == CommitOutcome::Trunk {
            if let Some(child) = self.orphans.take(id) {
                self.pending.push_back(child);
            }
        }
        let _ = packed.ack.send(());
        Ok(())
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[path = "consensus_test.rs"]
mod consensus_test;
