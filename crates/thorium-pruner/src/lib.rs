//! The state-compaction engine: a four-step cycle that archives the trie
//! nodes an accepted block range still needs and sweeps the stale history
//! out of the retired live space.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thorium_state::state::Account;
use thorium_state::{index, trie, SpacedNodeStore, EMPTY_ROOT};
use thorium_storage::{ChainRepository, KvStore};
use thorium_types::constants::MAX_STATE_HISTORY;
use thorium_types::{BlockId, B256};
use tokio::sync::watch;
use tracing::{debug, info};

const SPACE_META: &str = "pruner.meta";
const KEY_STATUS: &[u8] = b"status";

/// Blocks past the window a sweep additionally waits for, giving slow
/// readers room before their nodes disappear.
const SWEEP_SLACK: u32 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Initiate,
    ArchiveIndexTrie,
    ArchiveAccountTrie,
    DropStale,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Status {
    pub n1: u32,
    pub n2: u32,
    pub step: Step,
    pub cycles: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            n1: 0,
            n2: 0,
            step: Step::Initiate,
            cycles: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PrunerOptions {
    pub max_state_history: u32,
    pub poll_interval: Duration,
}

impl Default for PrunerOptions {
    fn default() -> Self {
        Self {
            max_state_history: MAX_STATE_HISTORY as u32,
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct Pruner {
    repo: Arc<ChainRepository>,
    kv: Arc<dyn KvStore>,
    store: Arc<SpacedNodeStore>,
    options: PrunerOptions,
}

impl Pruner {
    pub fn new(
        repo: Arc<ChainRepository>,
        kv: Arc<dyn KvStore>,
        store: Arc<SpacedNodeStore>,
        options: PrunerOptions,
    ) -> Self {
        Self {
            repo,
            kv,
            store,
            options,
        }
    }

    /// Cycles until cancelled. Cancellation at a step boundary is silent;
    /// storage errors end the loop for good.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut status = self.load_status()?;
        info!(?status.step, status.cycles, "pruner running");
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            match status.step {
                Step::Initiate => {
                    status.n1 = status.n2;
                    let best = self.repo.best_block_summary().number();
                    status.n2 = (best + 10).max(self.options.max_state_history);
                    self.store.switch_slot().context("switching live space")?;
                    status.step = Step::ArchiveIndexTrie;
                    self.save_status(&status)?;
                    if !self.wait_best_above(status.n2, &mut cancel).await {
                        return Ok(());
                    }
                }
                Step::ArchiveIndexTrie => {
                    let copied = self
                        .archive_index(status.n1, status.n2, status.cycles == 0)
                        .context("archiving index trie")?;
                    debug!(n1 = status.n1, n2 = status.n2, copied, "index trie archived");
                    status.step = Step::ArchiveAccountTrie;
                    self.save_status(&status)?;
                }
                Step::ArchiveAccountTrie => {
                    let copied = self
                        .archive_accounts(status.n1, status.n2, status.cycles == 0)
                        .context("archiving account trie")?;
                    debug!(n1 = status.n1, n2 = status.n2, copied, "account trie archived");
                    status.step = Step::DropStale;
                    self.save_status(&status)?;
                }
                Step::DropStale => {
                    let threshold = status.n2 + self.options.max_state_history + SWEEP_SLACK;
                    if !self.wait_best_above(threshold, &mut cancel).await {
                        return Ok(());
                    }
                    let swept = self
                        .store
                        .sweep_retired(status.n2)
                        .context("sweeping stale nodes")?;
                    status.cycles += 1;
                    status.step = Step::Initiate;
                    self.save_status(&status)?;
                    info!(swept, cycles = status.cycles, "prune cycle finished");
                }
            }
        }
    }

    /// Copies index-trie nodes reachable at `n2` but not at `n1` into the
    /// archive space. The very first cycle (`bootstrap`) archives the `n1`
    /// endpoint too, so the diff base is always fully archived.
    fn archive_index(&self, n1: u32, n2: u32, bootstrap: bool) -> Result<usize> {
        let root1 = self.index_root_at(n1)?;
        let root2 = self.index_root_at(n2)?;
        let mut copied = 0;
        if bootstrap {
            copied += self.archive_diff(root1, EMPTY_ROOT)?;
        }
        copied += self.archive_diff(root2, root1)?;
        Ok(copied)
    }

    /// Same for the account trie, recursing into storage tries whose root
    /// moved between the two blocks.
    fn archive_accounts(&self, n1: u32, n2: u32, bootstrap: bool) -> Result<usize> {
        let root1 = self.state_root_at(n1)?;
        let root2 = self.state_root_at(n2)?;
        let mut copied = 0;

        let old_accounts: HashMap<Vec<u8>, Account> = trie::leaves(self.store.as_ref(), root1)?
            .into_iter()
            .filter_map(|(key, raw)| Some((key, bcs::from_bytes(&raw).ok()?)))
            .collect();
        if bootstrap {
            copied += self.archive_diff(root1, EMPTY_ROOT)?;
            for account in old_accounts.values() {
                copied += self.archive_diff(B256::new(account.storage_root), EMPTY_ROOT)?;
            }
        }
        copied += self.archive_diff(root2, root1)?;

        for (key, raw) in trie::leaves(self.store.as_ref(), root2)? {
            let account: Account = match bcs::from_bytes(&raw) {
                Ok(account) => account,
                Err(_) => continue,
            };
            let old_root = old_accounts
                .get(&key)
                .map(|old| B256::new(old.storage_root))
                .unwrap_or(EMPTY_ROOT);
            let new_root = B256::new(account.storage_root);
            if new_root != old_root {
                copied += self.archive_diff(new_root, old_root)?;
            }
        }
        Ok(copied)
    }

    fn archive_diff(&self, new_root: B256, old_root: B256) -> Result<usize> {
        let mut copied = 0usize;
        trie::walk_diff(self.store.as_ref(), new_root, old_root, &mut |hash, bytes| {
            self.store.archive_node(&hash, bytes)?;
            copied += 1;
            Ok(())
        })?;
        Ok(copied)
    }

    fn index_root_at(&self, number: u32) -> Result<B256> {
        match self.block_id_at(number)? {
            None => Ok(EMPTY_ROOT),
            Some(id) => Ok(index::root_of(&self.kv, id)?),
        }
    }

    fn state_root_at(&self, number: u32) -> Result<B256> {
        match self.block_id_at(number)? {
            None => Ok(EMPTY_ROOT),
            Some(id) => Ok(self
                .repo
                .get_block_header(id)?
                .map(|header| header.state_root)
                .unwrap_or(EMPTY_ROOT)),
        }
    }

    fn block_id_at(&self, number: u32) -> Result<Option<BlockId>> {
        let best = self.repo.best_block_summary();
        let chain = self.repo.new_chain(best.id());
        Ok(chain.block_id_at(number)?)
    }

    /// Polls the best number; false means cancellation won the wait.
    async fn wait_best_above(&self, threshold: u32, cancel: &mut watch::Receiver<bool>) -> bool {
        loop {
            if self.repo.best_block_summary().number() > threshold {
                return true;
            }
            tokio::select! {
                _ = cancel.changed() => return false,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    fn load_status(&self) -> Result<Status> {
        match self.kv.get(SPACE_META, KEY_STATUS)? {
            None => Ok(Status::default()),
            Some(raw) => bcs::from_bytes(&raw).context("corrupt pruner status"),
        }
    }

    fn save_status(&self, status: &Status) -> Result<()> {
        let mut batch = self.kv.batch();
        batch.put(
            SPACE_META,
            KEY_STATUS,
            &bcs::to_bytes(status).context("encoding pruner status")?,
        );
        batch.write()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "pruner_test.rs"]
mod pruner_test;
