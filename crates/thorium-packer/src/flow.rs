//! A single in-progress candidate block: adopted transactions, their
//! receipts, and the working state that becomes the block's stage.

use secp256k1::SecretKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use thorium_state::runtime::ExecutionError;
use thorium_state::{builtins::Blocklist, Runtime, Stage, StateError};
use thorium_storage::Chain;
use thorium_types::block::txs_root;
use thorium_types::constants::{CLAUSE_GAS, TX_GAS};
use thorium_types::crypto::address_of;
use thorium_types::receipt::receipts_root;
use thorium_types::{
    Block, BlockId, Bytes, Features, ForkConfig, Header, Receipt, Transaction, TxId,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum AdoptError {
    /// Terminal for this tx; it can never enter a block here.
    #[error("bad tx: {0}")]
    BadTx(String),
    /// Transient; retry once the chain has moved.
    #[error("tx not adoptable now")]
    NotAdoptableNow,
    /// Its dependency settled the wrong way; drop it for good.
    #[error("tx not adoptable forever")]
    NotAdoptableForever,
    /// The candidate block cannot fit any further transaction.
    #[error("gas limit reached")]
    GasLimitReached,
    /// Already processed here or mined on the candidate chain.
    #[error("known tx")]
    KnownTx,
    #[error("internal: {0}")]
    Internal(String),
}

impl From<thorium_storage::StorageError> for AdoptError {
    fn from(e: thorium_storage::StorageError) -> Self {
        AdoptError::Internal(e.to_string())
    }
}

impl From<StateError> for AdoptError {
    fn from(e: StateError) -> Self {
        AdoptError::Internal(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PackError {
    /// The offered key does not belong to the scheduled proposer.
    #[error("private key mismatch")]
    KeyMismatch,
    #[error(transparent)]
    State(#[from] StateError),
}

pub struct Flow {
    parent: Header,
    parent_id: BlockId,
    chain: Chain,
    fork: ForkConfig,
    runtime: Runtime,
    txs: Vec<Transaction>,
    receipts: Vec<Receipt>,
    gas_used: u64,
    features: Features,
    processed: HashMap<TxId, bool>,
    pack_lock: Arc<Mutex<()>>,
}

impl Flow {
    pub(crate) fn new(
        parent: Header,
        chain: Chain,
        fork: ForkConfig,
        runtime: Runtime,
        pack_lock: Arc<Mutex<()>>,
    ) -> Self {
        let parent_id = parent.id();
        Self {
            parent,
            parent_id,
            chain,
            fork,
            runtime,
            txs: Vec::new(),
            receipts: Vec::new(),
            gas_used: 0,
            features: Features::default(),
            processed: HashMap::new(),
            pack_lock,
        }
    }

    /// Target block time of this candidate.
    pub fn when(&self) -> u64 {
        self.runtime.context().time
    }

    pub fn number(&self) -> u32 {
        self.runtime.context().number
    }

    pub fn total_score(&self) -> u64 {
        self.runtime.context().total_score
    }

    pub fn parent_id(&self) -> BlockId {
        self.parent_id
    }

    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    /// Tries to fit one mempool transaction into the candidate.
    pub fn adopt(&mut self, tx: &Transaction) -> Result<(), AdoptError> {
        let ctx = self.runtime.context();
        let number = ctx.number;
        let gas_limit = ctx.gas_limit;
        let supported = ctx.features;

        if tx.chain_tag != self.chain_tag() {
            return Err(AdoptError::BadTx("chain tag mismatch".into()));
        }
        if tx.features.has_unknown_bits() {
            return Err(AdoptError::BadTx("reserved feature bits set".into()));
        }
        if tx.features.is_delegated() && !supported.is_delegated() {
            return Err(AdoptError::BadTx("delegation not offered yet".into()));
        }
        if tx.is_expired(number) {
            return Err(AdoptError::BadTx("expired".into()));
        }
        let id = tx
            .id()
            .map_err(|e| AdoptError::BadTx(format!("unrecoverable signature: {e}")))?;
        let origin = tx
            .origin()
            .map_err(|e| AdoptError::BadTx(format!("unrecoverable signature: {e}")))?;
        if number >= self.fork.blocklist {
            if Blocklist::contains(self.runtime.state(), origin)? {
                return Err(AdoptError::BadTx("origin is block-listed".into()));
            }
            if let Ok(Some(delegator)) = tx.delegator() {
                if Blocklist::contains(self.runtime.state(), delegator)? {
                    return Err(AdoptError::BadTx("delegator is block-listed".into()));
                }
            }
        }

        if tx.block_ref_number() > self.parent.number() {
            return Err(AdoptError::NotAdoptableNow);
        }

        if self.processed.contains_key(&id) || self.chain.contains_tx(id)? {
            return Err(AdoptError::KnownTx);
        }

        if let Some(dep) = tx.depends_on {
            let reverted = match self.processed.get(&dep) {
                Some(reverted) => Some(*reverted),
                None => self.chain.find_tx(dep)?.map(|meta| meta.reverted),
            };
            match reverted {
                None => return Err(AdoptError::NotAdoptableNow),
                Some(true) => return Err(AdoptError::NotAdoptableForever),
                Some(false) => {}
            }
        }

        if self.gas_used.saturating_add(tx.gas) > gas_limit {
            let room = gas_limit - self.gas_used;
            return if room > TX_GAS + CLAUSE_GAS {
                Err(AdoptError::NotAdoptableNow)
            } else {
                Err(AdoptError::GasLimitReached)
            };
        }

        let checkpoint = self.runtime.state().new_checkpoint();
        match self.runtime.execute_transaction(tx) {
            Ok(receipt) => {
                self.gas_used += receipt.gas_used;
                self.features = self.features.union(tx.features);
                self.processed.insert(id, receipt.reverted);
                self.txs.push(tx.clone());
                self.receipts.push(receipt);
                Ok(())
            }
            Err(e @ (ExecutionError::IntrinsicGasExceedsProvided { .. }
            | ExecutionError::UnableToPayGas { .. }
            | ExecutionError::Tx(_))) => {
                self.runtime.state_mut().revert_to(checkpoint);
                Err(AdoptError::BadTx(e.to_string()))
            }
            Err(ExecutionError::State(e)) => {
                self.runtime.state_mut().revert_to(checkpoint);
                Err(e.into())
            }
        }
    }

    /// Stages the state, builds and signs the block. The stage is returned
    /// uncommitted; the chain owner decides whether it lands.
    pub fn pack(self, key: &SecretKey) -> Result<(Block, Stage, Vec<Receipt>), PackError> {
        let ctx = self.runtime.context().clone();
        if address_of(key) != ctx.signer {
            return Err(PackError::KeyMismatch);
        }

        let stage = {
            let _staging = self.pack_lock.lock().expect("pack lock poisoned");
            self.runtime.state().stage(ctx.number)?
        };

        let header = Header {
            parent_id: self.parent_id,
            timestamp: ctx.time,
            gas_limit: ctx.gas_limit,
            beneficiary: ctx.beneficiary,
            gas_used: self.gas_used,
            total_score: ctx.total_score,
            txs_root: txs_root(&self.txs),
            state_root: stage.hash(),
            receipts_root: receipts_root(&self.receipts),
            features: self.features,
            signature: Bytes::new(),
        }
        .sign(key);

        debug!(
            number = header.number(),
            txs = self.txs.len(),
            gas_used = self.gas_used,
            "block packed"
        );
        Ok((Block::new(header, self.txs), stage, self.receipts))
    }

    fn chain_tag(&self) -> u8 {
        self.runtime.context().chain_tag
    }
}
