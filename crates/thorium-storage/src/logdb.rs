//! Indexed event/transfer log database. One writer at a time appends rows
//! per committed block; the newest-block cursor tells recovery where the
//! log ends relative to the chain.

use crate::kv::KvStore;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thorium_types::{Address, Block, BlockId, Receipt, TxId, B256, U256};
use tracing::debug;

const SPACE_EVENTS: &str = "logdb.events";
const SPACE_TRANSFERS: &str = "logdb.transfers";
const SPACE_BLOCKS: &str = "logdb.blocks";
const SPACE_META: &str = "logdb.meta";

const KEY_NEWEST: &[u8] = b"newest";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub block_id: BlockId,
    pub block_number: u32,
    pub block_timestamp: u64,
    pub tx_id: TxId,
    pub tx_origin: Address,
    pub clause_index: u32,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRow {
    pub block_id: BlockId,
    pub block_number: u32,
    pub block_timestamp: u64,
    pub tx_id: TxId,
    pub tx_origin: Address,
    pub clause_index: u32,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
}

#[derive(Clone, Debug, Default)]
pub struct EventCriteria {
    /// Inclusive block-number range.
    pub range: Option<(u32, u32)>,
    pub address: Option<Address>,
    /// Every listed topic must appear on the row.
    pub topics: Vec<B256>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct TransferCriteria {
    pub range: Option<(u32, u32)>,
    pub tx_origin: Option<Address>,
    pub sender: Option<Address>,
    pub recipient: Option<Address>,
    pub limit: Option<usize>,
}

pub struct LogDb {
    kv: Arc<dyn KvStore>,
}

impl LogDb {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// A buffered writer; rows become visible only on [`LogDbWriter::commit`].
    pub fn new_writer(&self) -> LogDbWriter {
        LogDbWriter {
            kv: self.kv.clone(),
            staged_events: Vec::new(),
            staged_transfers: Vec::new(),
            staged_blocks: Vec::new(),
            newest: None,
        }
    }

    pub fn newest_block_id(&self) -> Result<Option<BlockId>> {
        match self.kv.get(SPACE_META, KEY_NEWEST)? {
            None => Ok(None),
            Some(raw) if raw.len() == 32 => Ok(Some(BlockId(B256::from_slice(&raw)))),
            Some(raw) => Err(StorageError::Corrupt {
                space: SPACE_META,
                reason: format!("newest cursor of {} bytes", raw.len()),
            }),
        }
    }

    pub fn has_block_id(&self, id: BlockId) -> Result<bool> {
        Ok(self.kv.get(SPACE_BLOCKS, &block_key(id))?.is_some())
    }

    /// Removes every row at block number ≥ `n` and rewinds the cursor.
    pub fn truncate(&self, n: u32) -> Result<()> {
        let mut batch = self.kv.batch();
        for space in [SPACE_EVENTS, SPACE_TRANSFERS, SPACE_BLOCKS] {
            for (key, _) in self.kv.scan_prefix(space, &[])? {
                if key_number(&key) >= n {
                    batch.delete(space, &key);
                }
            }
        }
        let survivor = self
            .kv
            .scan_prefix(SPACE_BLOCKS, &[])?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key_number(key) < n)
            .next_back();
        match survivor {
            Some(key) => batch.put(SPACE_META, KEY_NEWEST, &key[4..]),
            None => batch.delete(SPACE_META, KEY_NEWEST),
        }
        batch.write()?;
        debug!(upto = n, "log db truncated");
        Ok(())
    }

    pub fn filter_events(&self, criteria: &EventCriteria) -> Result<Vec<EventRow>> {
        let mut rows = Vec::new();
        for (key, value) in self.kv.scan_prefix(SPACE_EVENTS, &[])? {
            if !in_range(key_number(&key), criteria.range) {
                continue;
            }
            let row: EventRow = decode_row(&value, SPACE_EVENTS)?;
            if let Some(address) = criteria.address {
                if row.address != address {
                    continue;
                }
            }
            if !criteria.topics.iter().all(|t| row.topics.contains(t)) {
                continue;
            }
            rows.push(row);
            if criteria.limit.is_some_and(|l| rows.len() >= l) {
                break;
            }
        }
        Ok(rows)
    }

    pub fn filter_transfers(&self, criteria: &TransferCriteria) -> Result<Vec<TransferRow>> {
        let mut rows = Vec::new();
        for (key, value) in self.kv.scan_prefix(SPACE_TRANSFERS, &[])? {
            if !in_range(key_number(&key), criteria.range) {
                continue;
            }
            let row: TransferRow = decode_row(&value, SPACE_TRANSFERS)?;
            if criteria.tx_origin.is_some_and(|a| row.tx_origin != a)
                || criteria.sender.is_some_and(|a| row.sender != a)
                || criteria.recipient.is_some_and(|a| row.recipient != a)
            {
                continue;
            }
            rows.push(row);
            if criteria.limit.is_some_and(|l| rows.len() >= l) {
                break;
            }
        }
        Ok(rows)
    }
}

/// Buffers rows for one or more blocks, then lands them in a single batch.
pub struct LogDbWriter {
    kv: Arc<dyn KvStore>,
    staged_events: Vec<EventRow>,
    staged_transfers: Vec<TransferRow>,
    staged_blocks: Vec<BlockId>,
    newest: Option<BlockId>,
}

impl LogDbWriter {
    /// Stages every event and transfer the block's receipts produced.
    pub fn write(&mut self, block: &Block, receipts: &[Receipt]) -> Result<()> {
        let block_id = block.id();
        let header = block.header();
        for (tx, receipt) in block.txs().iter().zip(receipts) {
            let tx_id = tx.id().map_err(|e| StorageError::Corrupt {
                space: SPACE_EVENTS,
                reason: e.to_string(),
            })?;
            let tx_origin = tx.origin().map_err(|e| StorageError::Corrupt {
                space: SPACE_EVENTS,
                reason: e.to_string(),
            })?;
            for (clause_index, output) in receipt.outputs.iter().enumerate() {
                for event in &output.events {
                    self.staged_events.push(EventRow {
                        block_id,
                        block_number: header.number(),
                        block_timestamp: header.timestamp,
                        tx_id,
                        tx_origin,
                        clause_index: clause_index as u32,
                        address: event.address,
                        topics: event.topics.clone(),
                        data: event.data.to_vec(),
                    });
                }
                for transfer in &output.transfers {
                    self.staged_transfers.push(TransferRow {
                        block_id,
                        block_number: header.number(),
                        block_timestamp: header.timestamp,
                        tx_id,
                        tx_origin,
                        clause_index: clause_index as u32,
                        sender: transfer.sender,
                        recipient: transfer.recipient,
                        amount: transfer.amount,
                    });
                }
            }
        }
        self.staged_blocks.push(block_id);
        self.newest = Some(block_id);
        Ok(())
    }

    /// Whether anything is staged but not yet committed.
    pub fn is_dirty(&self) -> bool {
        !self.staged_blocks.is_empty()
    }

    /// Lands all staged rows atomically and advances the newest cursor.
    pub fn commit(&mut self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let mut batch = self.kv.batch();
        let mut seq_by_number: std::collections::HashMap<u32, u32> = Default::default();
        for row in self.staged_events.drain(..) {
            let seq = seq_by_number.entry(row.block_number).or_insert(0);
            batch.put(
                SPACE_EVENTS,
                &row_key(row.block_number, *seq),
                &bcs::to_bytes(&row).expect("event row encode"),
            );
            *seq += 1;
        }
        seq_by_number.clear();
        for row in self.staged_transfers.drain(..) {
            let seq = seq_by_number.entry(row.block_number).or_insert(0);
            batch.put(
                SPACE_TRANSFERS,
                &row_key(row.block_number, *seq),
                &bcs::to_bytes(&row).expect("transfer row encode"),
            );
            *seq += 1;
        }
        for block_id in self.staged_blocks.drain(..) {
            batch.put(SPACE_BLOCKS, &block_key(block_id), &[]);
        }
        if let Some(newest) = self.newest {
            batch.put(SPACE_META, KEY_NEWEST, newest.as_bytes());
        }
        batch.write()?;
        Ok(())
    }
}

fn row_key(number: u32, seq: u32) -> Vec<u8> {
    let mut key = number.to_be_bytes().to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn block_key(id: BlockId) -> Vec<u8> {
    let mut key = id.number().to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn key_number(key: &[u8]) -> u32 {
    u32::from_be_bytes(key[..4].try_into().expect("4-byte number prefix"))
}

fn in_range(number: u32, range: Option<(u32, u32)>) -> bool {
    match range {
        None => true,
        Some((from, to)) => number >= from && number <= to,
    }
}

fn decode_row<'a, T: Deserialize<'a>>(raw: &'a [u8], space: &'static str) -> Result<T> {
    bcs::from_bytes(raw).map_err(|e| StorageError::Corrupt {
        space,
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[path = "logdb_test.rs"]
mod logdb_test;
