//! Per-genesis instance directory: `<data-dir>/<last-8-bytes-of-genesis>`
//! holding the master key and the tx stash.

use anyhow::{Context, Result};
use rand::thread_rng;
use secp256k1::SecretKey;
use std::path::{Path, PathBuf};
use thorium_types::BlockId;
use tracing::info;

pub struct InstanceDir {
    path: PathBuf,
}

impl InstanceDir {
    pub fn open(data_dir: &str, genesis_id: BlockId) -> Result<Self> {
        let suffix = hex::encode(&genesis_id.as_bytes()[24..]);
        let path = Path::new(data_dir).join(suffix);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self { path })
    }

    /// Loads the node's signing key, generating and persisting one on
    /// first use.
    pub fn master_key(&self) -> Result<SecretKey> {
        let key_path = self.path.join("master.key");
        match std::fs::read_to_string(&key_path) {
            Ok(raw) => {
                let bytes = hex::decode(raw.trim()).context("master key is not hex")?;
                SecretKey::from_slice(&bytes).context("master key out of range")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = SecretKey::new(&mut thread_rng());
                std::fs::write(&key_path, hex::encode(key.secret_bytes()))
                    .with_context(|| format!("writing {}", key_path.display()))?;
                info!(path = %key_path.display(), "master key generated");
                Ok(key)
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", key_path.display())),
        }
    }

    pub fn tx_stash_path(&self) -> PathBuf {
        self.path.join("tx.stash")
    }
}
