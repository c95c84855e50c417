use crate::{PoolError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thorium_events::{Broadcaster, Subscription};
use thorium_storage::ChainRepository;
use thorium_types::constants::INITIAL_BASE_GAS_PRICE;
use thorium_types::{Address, Transaction, TxId, U256};
use tracing::{debug, warn};

/// Largest encoded transaction the pool accepts.
const MAX_TX_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxSource {
    Local,
    Remote,
}

/// Published for every accepted transaction.
#[derive(Clone)]
pub struct TxEvent {
    pub tx: Arc<Transaction>,
    pub id: TxId,
    pub source: TxSource,
    /// Whether the tx could go into a block built on the current best.
    pub executable: bool,
}

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub limit: usize,
    pub limit_per_account: usize,
    pub max_lifetime: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            limit: 10_000,
            limit_per_account: 128,
            max_lifetime: Duration::from_secs(20 * 60),
        }
    }
}

struct PoolEntry {
    tx: Arc<Transaction>,
    origin: Address,
    source: TxSource,
    added_at: Instant,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<TxId, PoolEntry>,
    per_account: HashMap<Address, usize>,
}

impl PoolInner {
    fn remove_entry(&mut self, id: &TxId) -> Option<PoolEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(count) = self.per_account.get_mut(&entry.origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_account.remove(&entry.origin);
            }
        }
        Some(entry)
    }
}

/// Multi-producer pool; internally synchronized.
pub struct TxPool {
    repo: Arc<ChainRepository>,
    options: PoolOptions,
    inner: Mutex<PoolInner>,
    events: Broadcaster<TxEvent>,
}

impl TxPool {
    pub fn new(repo: Arc<ChainRepository>, options: PoolOptions) -> Self {
        Self {
            repo,
            options,
            inner: Mutex::new(PoolInner::default()),
            events: Broadcaster::new(),
        }
    }

    pub fn subscribe_tx_events(&self) -> Subscription<TxEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: TxId) -> bool {
        self.inner.lock().expect("pool lock").entries.contains_key(&id)
    }

    /// Validates and admits a transaction, evicting the oldest remote
    /// entry when the pool is at capacity.
    pub fn add(&self, tx: Transaction, source: TxSource) -> Result<TxId> {
        let best = self.repo.best_block_summary();

        if tx.chain_tag != self.repo.chain_tag() {
            return Err(PoolError::BadTx("chain tag mismatch"));
        }
        if tx.features.has_unknown_bits() {
            return Err(PoolError::BadTx("reserved feature bits set"));
        }
        if tx.encoded_size() > MAX_TX_SIZE {
            return Err(PoolError::BadTx("tx too large"));
        }
        let origin = tx
            .origin()
            .map_err(|_| PoolError::BadTx("unrecoverable signature"))?;
        tx.delegator()
            .map_err(|_| PoolError::BadTx("unrecoverable delegator signature"))?;
        let intrinsic = tx
            .intrinsic_gas()
            .map_err(|_| PoolError::BadTx("intrinsic gas overflow"))?;
        if tx.gas < intrinsic {
            return Err(PoolError::BadTx("gas below intrinsic"));
        }
        if tx.is_expired(best.number()) {
            return Err(PoolError::BadTx("expired"));
        }
        let id = tx.id().map_err(|_| PoolError::BadTx("unrecoverable signature"))?;

        let chain = self.repo.new_chain(best.id());
        if chain.contains_tx(id)? {
            return Err(PoolError::Known(id));
        }

        let executable =
            tx.block_ref_number() <= best.number() && !tx.is_expired(best.number() + 1);
        let tx = Arc::new(tx);

        {
            let mut inner = self.inner.lock().expect("pool lock");
            if inner.entries.contains_key(&id) {
                return Err(PoolError::Known(id));
            }
            let account_count = inner.per_account.get(&origin).copied().unwrap_or(0);
            if account_count >= self.options.limit_per_account {
                return Err(PoolError::AccountQuota);
            }
            if inner.entries.len() >= self.options.limit {
                let victim = inner
                    .entries
                    .iter()
                    .filter(|(_, e)| e.source == TxSource::Remote)
                    .min_by_key(|(_, e)| e.added_at)
                    .map(|(id, _)| *id);
                match victim {
                    Some(victim) => {
                        inner.remove_entry(&victim);
                        debug!(tx = %victim, "pool full, evicted oldest remote tx");
                    }
                    None => return Err(PoolError::Full),
                }
            }
            inner.entries.insert(
                id,
                PoolEntry {
                    tx: tx.clone(),
                    origin,
                    source,
                    added_at: Instant::now(),
                },
            );
            *inner.per_account.entry(origin).or_insert(0) += 1;
        }

        self.events.send(TxEvent {
            tx,
            id,
            source,
            executable,
        });
        Ok(id)
    }

    pub fn remove(&self, id: TxId) -> bool {
        self.inner
            .lock()
            .expect("pool lock")
            .remove_entry(&id)
            .is_some()
    }

    /// Re-admits transactions displaced by a re-org, bypassing the known-tx
    /// check against the (already switched) best chain.
    pub fn reinsert(&self, tx: Arc<Transaction>) {
        let Ok(id) = tx.id() else {
            return;
        };
        let Ok(origin) = tx.origin() else {
            return;
        };
        let mut inner = self.inner.lock().expect("pool lock");
        if inner.entries.contains_key(&id) || inner.entries.len() >= self.options.limit {
            return;
        }
        inner.entries.insert(
            id,
            PoolEntry {
                tx,
                origin,
                source: TxSource::Remote,
                added_at: Instant::now(),
            },
        );
        *inner.per_account.entry(origin).or_insert(0) += 1;
    }

    /// A snapshot of transactions adoptable on top of the current best,
    /// highest-bidding first. Expired and over-age entries are washed out
    /// as a side effect.
    pub fn executables(&self) -> Vec<Arc<Transaction>> {
        let best = self.repo.best_block_summary();
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("pool lock");

        let stale: Vec<TxId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.tx.is_expired(best.number() + 1)
                    || now.duration_since(entry.added_at) > self.options.max_lifetime
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            inner.remove_entry(id);
        }
        if !stale.is_empty() {
            warn!(count = stale.len(), "washed out stale txs");
        }

        let mut ready: Vec<(U256, Instant, Arc<Transaction>)> = inner
            .entries
            .values()
            .filter(|entry| entry.tx.block_ref_number() <= best.number())
            .map(|entry| {
                (
                    entry.tx.gas_price(INITIAL_BASE_GAS_PRICE),
                    entry.added_at,
                    entry.tx.clone(),
                )
            })
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ready.into_iter().map(|(_, _, tx)| tx).collect()
    }

    /// Every pooled transaction, for stashing at shutdown.
    pub fn all(&self) -> Vec<Arc<Transaction>> {
        self.inner
            .lock()
            .expect("pool lock")
            .entries
            .values()
            .map(|entry| entry.tx.clone())
            .collect()
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
