//! Storage for the chain: a keyspaced KV abstraction with atomic batches,
//! the canonical block repository, and the indexed log database.

pub mod chain;
pub mod kv;
pub mod logdb;

pub use chain::{BestBlockEvent, BlockSummary, Chain, ChainRepository, TxMeta};
pub use kv::{KvBatch, KvError, KvSnapshot, KvStore, MemKv};
pub use logdb::{EventCriteria, EventRow, LogDb, LogDbWriter, TransferCriteria, TransferRow};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("kv: {0}")]
    Kv(#[from] KvError),
    #[error("corrupt record under {space}: {reason}")]
    Corrupt { space: &'static str, reason: String },
    #[error("unknown block {0}")]
    UnknownBlock(thorium_types::BlockId),
    #[error("genesis mismatch: store has {stored}, node configured {configured}")]
    GenesisMismatch {
        stored: thorium_types::BlockId,
        configured: thorium_types::BlockId,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;
