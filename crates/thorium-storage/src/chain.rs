//! The canonical block repository: summaries, number and tx indexes, the
//! best pointer, and consistent chain views hanging off any head.

use crate::kv::KvStore;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use thorium_events::{Broadcaster, Subscription};
use thorium_types::{Block, BlockId, Header, Receipt, TxId};
use tracing::info;

const SPACE_BLOCKS: &str = "chain.blocks";
const SPACE_NUMBER_INDEX: &str = "chain.number-index";
const SPACE_TX_INDEX: &str = "chain.tx-index";
const SPACE_META: &str = "chain.meta";

const KEY_BEST: &[u8] = b"best";
const KEY_GENESIS: &[u8] = b"genesis";

#[derive(Serialize, Deserialize)]
struct BlockRecord {
    block: Vec<u8>,
    receipts: Vec<u8>,
    conflicts: u32,
}

#[derive(Serialize, Deserialize)]
struct TxLocation {
    block_id: [u8; 32],
    index: u32,
    reverted: bool,
}

/// Header-level view of a stored block, enough for scheduling and
/// validation without re-reading the body.
#[derive(Clone, Debug)]
pub struct BlockSummary {
    pub header: Header,
    pub tx_ids: Vec<TxId>,
    pub conflicts: u32,
}

impl BlockSummary {
    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn number(&self) -> u32 {
        self.header.number()
    }
}

/// Published whenever the best pointer advances.
pub type BestBlockEvent = Arc<BlockSummary>;

/// Where a transaction landed on some chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxMeta {
    pub block_id: BlockId,
    pub index: u32,
    pub reverted: bool,
}

pub struct ChainRepository {
    kv: Arc<dyn KvStore>,
    genesis_id: BlockId,
    tag: u8,
    best: RwLock<Arc<BlockSummary>>,
    /// Serializes every chain write; the commit batch is the atomic unit.
    write_lock: Mutex<()>,
    best_events: Broadcaster<BestBlockEvent>,
}

impl ChainRepository {
    /// Opens the repository, committing `genesis` on first use and
    /// verifying it on every later one.
    pub fn initialize(kv: Arc<dyn KvStore>, genesis: Block) -> Result<Arc<Self>> {
        let genesis_id = genesis.id();
        let tag = genesis_id.0[31];
        let repo = Arc::new(Self {
            kv,
            genesis_id,
            tag,
            best: RwLock::new(Arc::new(BlockSummary {
                header: genesis.header().clone(),
                tx_ids: Vec::new(),
                conflicts: 0,
            })),
            write_lock: Mutex::new(()),
            best_events: Broadcaster::new(),
        });

        match repo.kv.get(SPACE_META, KEY_GENESIS)? {
            None => {
                repo.add_block(genesis, Vec::new(), 0, true)?;
                let mut batch = repo.kv.batch();
                batch.put(SPACE_META, KEY_GENESIS, genesis_id.as_bytes());
                batch.write()?;
                info!(genesis = %genesis_id, "chain initialized");
            }
            Some(stored) => {
                let stored = decode_id(&stored, SPACE_META)?;
                if stored != genesis_id {
                    return Err(StorageError::GenesisMismatch {
                        stored,
                        configured: genesis_id,
                    });
                }
                let best_raw = repo.kv.get(SPACE_META, KEY_BEST)?.ok_or_else(|| {
                    StorageError::Corrupt {
                        space: SPACE_META,
                        reason: "best pointer missing".into(),
                    }
                })?;
                let best_id = decode_id(&best_raw, SPACE_META)?;
                let summary = repo
                    .load_summary(best_id)?
                    .ok_or(StorageError::UnknownBlock(best_id))?;
                *repo.best.write().expect("best lock poisoned") = Arc::new(summary);
            }
        }
        Ok(repo)
    }

    pub fn genesis_id(&self) -> BlockId {
        self.genesis_id
    }

    /// Low byte of the genesis id; transactions carry it as `chain_tag`.
    pub fn chain_tag(&self) -> u8 {
        self.tag
    }

    pub fn best_block_summary(&self) -> Arc<BlockSummary> {
        self.best.read().expect("best lock poisoned").clone()
    }

    pub fn subscribe_best(&self) -> Subscription<BestBlockEvent> {
        self.best_events.subscribe()
    }

    pub fn get_block_summary(&self, id: BlockId) -> Result<Option<BlockSummary>> {
        self.load_summary(id)
    }

    pub fn get_block_header(&self, id: BlockId) -> Result<Option<Header>> {
        Ok(self.load_summary(id)?.map(|s| s.header))
    }

    pub fn get_block(&self, id: BlockId) -> Result<Option<Block>> {
        match self.record(id)? {
            None => Ok(None),
            Some(record) => Ok(Some(decode_block(&record.block)?)),
        }
    }

    pub fn get_block_receipts(&self, id: BlockId) -> Result<Option<Vec<Receipt>>> {
        match self.record(id)? {
            None => Ok(None),
            Some(record) => {
                let receipts = alloy_rlp::Decodable::decode(&mut record.receipts.as_slice())
                    .map_err(|e| StorageError::Corrupt {
                        space: SPACE_BLOCKS,
                        reason: e.to_string(),
                    })?;
                Ok(Some(receipts))
            }
        }
    }

    pub fn contains_block(&self, id: BlockId) -> Result<bool> {
        Ok(self.kv.get(SPACE_BLOCKS, id.as_bytes())?.is_some())
    }

    /// Ids of every stored block at `number`, in insertion order.
    pub fn block_ids_at(&self, number: u32) -> Result<Vec<BlockId>> {
        let hits = self
            .kv
            .scan_prefix(SPACE_NUMBER_INDEX, &number.to_be_bytes())?;
        hits.iter()
            .map(|(key, _)| decode_id(&key[4..], SPACE_NUMBER_INDEX))
            .collect()
    }

    /// Count of blocks already persisted at `number`; the `conflicts`
    /// value a commit at that height should carry.
    pub fn conflicts_at(&self, number: u32) -> Result<u32> {
        Ok(self.block_ids_at(number)?.len() as u32)
    }

    /// Persists a block with its receipts as one atomic batch and, when
    /// `as_best`, advances the best pointer and notifies subscribers.
    pub fn add_block(
        &self,
        block: Block,
        receipts: Vec<Receipt>,
        conflicts: u32,
        as_best: bool,
    ) -> Result<Arc<BlockSummary>> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");

        let id = block.id();
        let header = block.header().clone();
        if header.number() > 0 && !self.contains_block(header.parent_id)? {
            return Err(StorageError::UnknownBlock(header.parent_id));
        }

        let mut tx_ids = Vec::with_capacity(block.txs().len());
        for tx in block.txs() {
            tx_ids.push(tx.id().map_err(|e| StorageError::Corrupt {
                space: SPACE_BLOCKS,
                reason: e.to_string(),
            })?);
        }

        let mut batch = self.kv.batch();
        if !self.contains_block(id)? {
            let record = BlockRecord {
                block: alloy_rlp::encode(&block),
                receipts: alloy_rlp::encode(&receipts),
                conflicts,
            };
            batch.put(SPACE_BLOCKS, id.as_bytes(), &encode_record(&record));
            let mut index_key = header.number().to_be_bytes().to_vec();
            index_key.extend_from_slice(id.as_bytes());
            batch.put(SPACE_NUMBER_INDEX, &index_key, &[]);

            for (index, tx_id) in tx_ids.iter().enumerate() {
                let mut locations = self.tx_locations(*tx_id)?;
                locations.push(TxLocation {
                    block_id: id.0 .0,
                    index: index as u32,
                    reverted: receipts.get(index).map(|r| r.reverted).unwrap_or(false),
                });
                batch.put(
                    SPACE_TX_INDEX,
                    tx_id.as_bytes(),
                    &bcs::to_bytes(&locations).expect("tx locations encode"),
                );
            }
        }
        if as_best {
            batch.put(SPACE_META, KEY_BEST, id.as_bytes());
        }
        batch.write()?;

        let summary = Arc::new(BlockSummary {
            header,
            tx_ids,
            conflicts,
        });
        if as_best {
            *self.best.write().expect("best lock poisoned") = summary.clone();
            self.best_events.send(summary.clone());
        }
        Ok(summary)
    }

    /// A consistent view of the chain ending at `head_id`.
    pub fn new_chain(self: &Arc<Self>, head_id: BlockId) -> Chain {
        Chain {
            repo: self.clone(),
            head_id,
        }
    }

    fn record(&self, id: BlockId) -> Result<Option<BlockRecord>> {
        match self.kv.get(SPACE_BLOCKS, id.as_bytes())? {
            None => Ok(None),
            Some(raw) => Ok(Some(bcs::from_bytes(&raw).map_err(|e| {
                StorageError::Corrupt {
                    space: SPACE_BLOCKS,
                    reason: e.to_string(),
                }
            })?)),
        }
    }

    fn load_summary(&self, id: BlockId) -> Result<Option<BlockSummary>> {
        let Some(record) = self.record(id)? else {
            return Ok(None);
        };
        let block = decode_block(&record.block)?;
        let mut tx_ids = Vec::with_capacity(block.txs().len());
        for tx in block.txs() {
            tx_ids.push(tx.id().map_err(|e| StorageError::Corrupt {
                space: SPACE_BLOCKS,
                reason: e.to_string(),
            })?);
        }
        let (header, _) = block.into_parts();
        Ok(Some(BlockSummary {
            header,
            tx_ids,
            conflicts: record.conflicts,
        }))
    }

    fn tx_locations(&self, tx_id: TxId) -> Result<Vec<TxLocation>> {
        match self.kv.get(SPACE_TX_INDEX, tx_id.as_bytes())? {
            None => Ok(Vec::new()),
            Some(raw) => Ok(bcs::from_bytes(&raw).map_err(|e| StorageError::Corrupt {
                space: SPACE_TX_INDEX,
                reason: e.to_string(),
            })?),
        }
    }
}

/// A chain snapshot: the ancestry of one head. Lookups answer "on this
/// chain", not "in the repository".
pub struct Chain {
    repo: Arc<ChainRepository>,
    head_id: BlockId,
}

impl Chain {
    pub fn head_id(&self) -> BlockId {
        self.head_id
    }

    /// Id of the ancestor at `number`, walking parent links from the head.
    pub fn block_id_at(&self, number: u32) -> Result<Option<BlockId>> {
        if number > self.head_id.number() {
            return Ok(None);
        }
        let mut cursor = self.head_id;
        while cursor.number() > number {
            let header = self
                .repo
                .get_block_header(cursor)?
                .ok_or(StorageError::UnknownBlock(cursor))?;
            cursor = header.parent_id;
        }
        Ok(Some(cursor))
    }

    pub fn contains_block(&self, id: BlockId) -> Result<bool> {
        Ok(self.block_id_at(id.number())? == Some(id))
    }

    /// Locates `tx_id` on this chain, if any ancestor holds it.
    pub fn find_tx(&self, tx_id: TxId) -> Result<Option<TxMeta>> {
        for location in self.repo.tx_locations(tx_id)? {
            let block_id = BlockId(thorium_types::B256::new(location.block_id));
            if self.contains_block(block_id)? {
                return Ok(Some(TxMeta {
                    block_id,
                    index: location.index,
                    reverted: location.reverted,
                }));
            }
        }
        Ok(None)
    }

    pub fn contains_tx(&self, tx_id: TxId) -> Result<bool> {
        Ok(self.find_tx(tx_id)?.is_some())
    }
}

fn encode_record(record: &BlockRecord) -> Vec<u8> {
    bcs::to_bytes(record).expect("block record encode")
}

fn decode_block(raw: &[u8]) -> Result<Block> {
    alloy_rlp::Decodable::decode(&mut &raw[..]).map_err(|e| StorageError::Corrupt {
        space: SPACE_BLOCKS,
        reason: e.to_string(),
    })
}

fn decode_id(raw: &[u8], space: &'static str) -> Result<BlockId> {
    if raw.len() != 32 {
        return Err(StorageError::Corrupt {
            space,
            reason: format!("id of {} bytes", raw.len()),
        });
    }
    Ok(BlockId(thorium_types::B256::from_slice(raw)))
}

#[cfg(test)]
#[path = "chain_test.rs"]
mod chain_test;
