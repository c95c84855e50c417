//! The single atomic commit path: state nodes, the chain index, the log
//! database and the repository, with fork handling on trunk switches.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use thorium_network::PeerNet;
use thorium_state::{index, NodeStore, Stage};
use thorium_storage::{ChainRepository, KvStore, LogDb};
use thorium_txpool::TxPool;
use thorium_types::{Block, BlockId, Receipt, TxId};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The block became the new best.
    Trunk,
    /// Stored as a side chain; best unchanged.
    Branch,
}

pub struct Committer {
    repo: Arc<ChainRepository>,
    kv: Arc<dyn KvStore>,
    node_store: Arc<dyn NodeStore>,
    logdb: Arc<LogDb>,
    pool: Arc<TxPool>,
    net: Arc<dyn PeerNet>,
    skip_logs: bool,
}

impl Committer {
    pub fn new(
        repo: Arc<ChainRepository>,
        kv: Arc<dyn KvStore>,
        node_store: Arc<dyn NodeStore>,
        logdb: Arc<LogDb>,
        pool: Arc<TxPool>,
        net: Arc<dyn PeerNet>,
        skip_logs: bool,
    ) -> Self {
        Self {
            repo,
            kv,
            node_store,
            logdb,
            pool,
            net,
            skip_logs,
        }
    }

    /// Lands a validated (or locally packed) block. Trunk/branch is decided
    /// here: highest total score wins, ties break toward the lower id.
    pub fn commit_block(
        &self,
        block: Arc<Block>,
        stage: Option<Stage>,
        receipts: Vec<Receipt>,
    ) -> Result<CommitOutcome> {
        let header = block.header().clone();
        let id = block.id();

        if let Some(stage) = stage {
            stage.commit().context("committing state stage")?;
        }
        let parent_index_root = index::root_of(&self.kv, header.parent_id)
            .context("reading parent index root")?;
        index::extend(self.node_store.as_ref(), &self.kv, parent_index_root, id)
            .context("extending chain index")?;

        let best = self.repo.best_block_summary();
        let becomes_best = header.total_score > best.header.total_score
            || (header.total_score == best.header.total_score && id < best.id());
        let conflicts = self.repo.conflicts_at(header.number())?;

        if !becomes_best {
            self.repo
                .add_block((*block).clone(), receipts, conflicts, false)?;
            debug!(block = %id, "branch block committed");
            return Ok(CommitOutcome::Branch);
        }

        // Fork set relative to the outgoing best: everything below the
        // common ancestor stays, the rest swaps sides.
        let ancestor = self.common_ancestor(best.id(), header.parent_id)?;
        let abandoned = self.path_down_to(best.id(), ancestor)?;
        let adopted = self.path_down_to(header.parent_id, ancestor)?;

        if !abandoned.is_empty() {
            info!(
                from = %best.id(),
                to = %id,
                depth = abandoned.len(),
                "trunk switch"
            );
            self.requeue_branch_txs(&abandoned, &adopted, &block)?;
        }

        if !self.skip_logs {
            let mut writer = self.logdb.new_writer();
            if !abandoned.is_empty() {
                self.logdb
                    .truncate(ancestor.number() + 1)
                    .context("rewinding log db")?;
                for adopted_id in adopted.iter().rev() {
                    let adopted_block = self
                        .repo
                        .get_block(*adopted_id)?
                        .context("adopted block missing")?;
                    let adopted_receipts = self
                        .repo
                        .get_block_receipts(*adopted_id)?
                        .context("adopted receipts missing")?;
                    writer.write(&adopted_block, &adopted_receipts)?;
                }
            }
            writer.write(&block, &receipts)?;
            writer.commit().context("committing log db rows")?;
        }

        self.repo
            .add_block((*block).clone(), receipts, conflicts, true)?;
        self.net.broadcast_block(block);
        debug!(block = %id, "trunk block committed");
        Ok(CommitOutcome::Trunk)
    }

    /// Highest common ancestor of two committed block ids.
    fn common_ancestor(&self, a: BlockId, b: BlockId) -> Result<BlockId> {
        let mut a = a;
        let mut b = b;
        while a != b {
            if a.number() > b.number() {
                a = self.parent_of(a)?;
            } else if b.number() > a.number() {
                b = self.parent_of(b)?;
            } else {
                a = self.parent_of(a)?;
                b = self.parent_of(b)?;
            }
        }
        Ok(a)
    }

    /// Ids from `from` down to (excluding) `ancestor`, head first.
    fn path_down_to(&self, from: BlockId, ancestor: BlockId) -> Result<Vec<BlockId>> {
        let mut path = Vec::new();
        let mut cursor = from;
        while cursor != ancestor {
            path.push(cursor);
            cursor = self.parent_of(cursor)?;
        }
        Ok(path)
    }

    fn parent_of(&self, id: BlockId) -> Result<BlockId> {
        Ok(self
            .repo
            .get_block_header(id)?
            .with_context(|| format!("missing header {id}"))?
            .parent_id)
    }

    /// Returns abandoned-side transactions to the pool unless the adopted
    /// side mined them too.
    fn requeue_branch_txs(
        &self,
        abandoned: &[BlockId],
        adopted: &[BlockId],
        new_block: &Block,
    ) -> Result<()> {
        let mut mined: HashSet<TxId> = HashSet::new();
        for adopted_id in adopted {
            let summary = self
                .repo
                .get_block_summary(*adopted_id)?
                .context("adopted summary missing")?;
            mined.extend(summary.tx_ids);
        }
        for tx in new_block.txs() {
            if let Ok(id) = tx.id() {
                mined.insert(id);
            }
        }

        let mut requeued = 0usize;
        for abandoned_id in abandoned {
            let block = self
                .repo
                .get_block(*abandoned_id)?
                .context("abandoned block missing")?;
            for tx in block.txs() {
                let Ok(id) = tx.id() else { continue };
                if !mined.contains(&id) {
                    self.pool.reinsert(Arc::new(tx.clone()));
                    requeued += 1;
                }
            }
        }
        if requeued > 0 {
            info!(count = requeued, "branch txs returned to the pool");
        }
        Ok(())
    }
}
