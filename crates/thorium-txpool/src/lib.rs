//! The transaction pool: validated, limit-bounded buffering between the
//! network/local submitters and the packer, with an event feed and an
//! on-disk stash for restarts.

mod pool;
mod stash;

pub use pool::{PoolOptions, TxEvent, TxPool, TxSource};
pub use stash::TxStash;

use thiserror::Error;
use thorium_types::ids::TxId;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Structurally unacceptable; the sender should drop it for good.
    #[error("bad tx: {0}")]
    BadTx(&'static str),
    #[error("known tx {0}")]
    Known(TxId),
    #[error("pool is full")]
    Full,
    #[error("account quota exceeded")]
    AccountQuota,
    #[error("storage: {0}")]
    Storage(#[from] thorium_storage::StorageError),
    #[error("stash io: {0}")]
    Io(#[from] std::io::Error),
    #[error("stash encoding: {0}")]
    Stash(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
