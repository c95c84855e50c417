//! Persists pooled transactions across restarts: a bcs list of RLP tx
//! payloads in the instance directory.

use crate::pool::{TxPool, TxSource};
use crate::{PoolError, Result};
use alloy_rlp::Decodable;
use std::path::PathBuf;
use std::sync::Arc;
use thorium_types::Transaction;
use tracing::{info, warn};

pub struct TxStash {
    path: PathBuf,
}

impl TxStash {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Writes the pool's current content, replacing any previous stash.
    pub fn save(&self, pool: &TxPool) -> Result<()> {
        let raw: Vec<Vec<u8>> = pool
            .all()
            .iter()
            .map(|tx| alloy_rlp::encode(tx.as_ref()))
            .collect();
        let encoded = bcs::to_bytes(&raw).map_err(|e| PoolError::Stash(e.to_string()))?;
        std::fs::write(&self.path, encoded)?;
        info!(count = raw.len(), path = %self.path.display(), "tx stash saved");
        Ok(())
    }

    /// Feeds stashed transactions back into the pool; entries the pool now
    /// refuses (expired, already mined) are dropped silently.
    pub fn load(&self, pool: &Arc<TxPool>) -> Result<usize> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let raw: Vec<Vec<u8>> =
            bcs::from_bytes(&bytes).map_err(|e| PoolError::Stash(e.to_string()))?;
        let mut restored = 0;
        for payload in raw {
            let Ok(tx) = Transaction::decode(&mut payload.as_slice()) else {
                warn!("undecodable stash entry dropped");
                continue;
            };
            if pool.add(tx, TxSource::Local).is_ok() {
                restored += 1;
            }
        }
        info!(count = restored, "tx stash loaded");
        Ok(restored)
    }
}
