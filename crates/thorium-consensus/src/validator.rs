//! Full block validation against the parent: header rules, PoA schedule
//! legality, transaction replay, and state-root agreement.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use thorium_packer::sched::{Proposer, Scheduler, SchedulerV1, SchedulerV2};
use thorium_state::builtins::{
    Authority, Blocklist, Params, KEY_BASE_GAS_PRICE, KEY_ENDORSEMENT, KEY_MAX_BLOCK_PROPOSERS,
};
use thorium_state::{BlockContext, Runtime, Stage, StateError, Stater};
use thorium_storage::{BlockSummary, ChainRepository, StorageError};
use thorium_types::constants::{
    FUTURE_TIMESTAMP_TOLERANCE, GAS_LIMIT_BOUND_DIVISOR, INITIAL_BASE_GAS_PRICE,
    MAX_BLOCK_PROPOSERS, MIN_GAS_LIMIT,
};
use thorium_types::crypto::blake2b256;
use thorium_types::receipt::receipts_root;
use thorium_types::{Block, Features, ForkConfig, Receipt, TxId, U256};

#[derive(Debug, Error)]
pub enum ValidationError {
    /// Ahead of local time; park it and retry.
    #[error("future block")]
    FutureBlock,
    /// Permanently unacceptable; drop and forget.
    #[error("invalid block: {0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<StateError> for ValidationError {
    fn from(e: StateError) -> Self {
        ValidationError::Internal(e.to_string())
    }
}

impl From<StorageError> for ValidationError {
    fn from(e: StorageError) -> Self {
        ValidationError::Internal(e.to_string())
    }
}

fn invalid(reason: impl Into<String>) -> ValidationError {
    ValidationError::Invalid(reason.into())
}

pub struct Consensus {
    stater: Stater,
    repo: Arc<ChainRepository>,
    fork: ForkConfig,
    block_interval: u64,
}

impl Consensus {
    pub fn new(
        stater: Stater,
        repo: Arc<ChainRepository>,
        fork: ForkConfig,
        block_interval: u64,
    ) -> Self {
        Self {
            stater,
            repo,
            fork,
            block_interval,
        }
    }

    /// Validates `block` against its parent and replays it, returning the
    /// uncommitted stage and the receipts on success.
    pub fn process(
        &self,
        parent: &BlockSummary,
        block: &Block,
        now: u64,
    ) -> Result<(Stage, Vec<Receipt>), ValidationError> {
        let header = block.header();
        if header.timestamp > now + FUTURE_TIMESTAMP_TOLERANCE {
            return Err(ValidationError::FutureBlock);
        }
        self.validate_header(parent, block)?;

        let mut state = self.stater.new_state(parent.header.state_root);
        let signer = header
            .signer()
            .map_err(|e| invalid(format!("unrecoverable signature: {e}")))?;

        // PoA legality: the signer must own this very slot, and the score
        // must match what the schedule yields.
        let endorsement = Params::get_or(&state, KEY_ENDORSEMENT, U256::ZERO)?;
        let max_proposers =
            Params::get_or(&state, KEY_MAX_BLOCK_PROPOSERS, U256::from(MAX_BLOCK_PROPOSERS))?
                .min(U256::from(u64::MAX))
                .to::<u64>();
        let rows = Authority::rows(&state)?;
        let mut proposers = Vec::new();
        for row in &rows {
            if state.balance(row.endorsor)? < endorsement {
                continue;
            }
            if proposers.len() as u64 >= max_proposers {
                break;
            }
            proposers.push(Proposer {
                address: row.signer,
                active: row.active,
            });
        }
        let number = header.number();
        let scheduler = if number >= self.fork.vip214 {
            let seed = blake2b256(&[parent.id().as_bytes()]);
            SchedulerV2::new(
                signer,
                &proposers,
                parent.number(),
                parent.header.timestamp,
                self.block_interval,
                seed,
            )
            .map(Scheduler::V2)
        } else {
            SchedulerV1::new(
                signer,
                &proposers,
                parent.number(),
                parent.header.timestamp,
                self.block_interval,
            )
            .map(Scheduler::V1)
        }
        .map_err(|_| invalid("signer is not an authorized proposer"))?;

        if !scheduler.is_scheduled(header.timestamp) {
            return Err(invalid("slot does not belong to the signer"));
        }
        let (updates, score) = scheduler.updates(header.timestamp);
        if parent.header.total_score + score != header.total_score {
            return Err(invalid(format!(
                "total score {} does not match schedule ({} + {})",
                header.total_score, parent.header.total_score, score
            )));
        }
        for update in &updates {
            Authority::update_active(&mut state, update.address, update.active)?;
        }

        let base_gas_price = Params::get_or(&state, KEY_BASE_GAS_PRICE, INITIAL_BASE_GAS_PRICE)?;
        let supported = self.supported_features(number);
        let context = BlockContext {
            chain_tag: self.repo.chain_tag(),
            beneficiary: header.beneficiary,
            signer,
            number,
            time: header.timestamp,
            gas_limit: header.gas_limit,
            total_score: header.total_score,
            features: supported,
            base_gas_price,
        };
        let mut runtime = Runtime::new(state, context);

        let (receipts, gas_used, tx_features) =
            self.execute_body(parent, block, supported, &mut runtime)?;

        if gas_used != header.gas_used {
            return Err(invalid(format!(
                "gas used {} does not match execution {gas_used}",
                header.gas_used
            )));
        }
        if receipts_root(&receipts) != header.receipts_root {
            return Err(invalid("receipts root mismatch"));
        }
        if tx_features != header.features {
            return Err(invalid("tx features bitset mismatch"));
        }

        let stage = runtime.into_state().stage(number)?;
        if stage.hash() != header.state_root {
            return Err(invalid(format!(
                "state root mismatch: header {} computed {}",
                header.state_root,
                stage.hash()
            )));
        }
        Ok((stage, receipts))
    }

    fn validate_header(&self, parent: &BlockSummary, block: &Block) -> Result<(), ValidationError> {
        let header = block.header();
        if header.timestamp <= parent.header.timestamp
            || (header.timestamp - parent.header.timestamp) % self.block_interval != 0
        {
            return Err(invalid("timestamp off the slot cadence"));
        }
        let parent_limit = parent.header.gas_limit;
        let drift = (parent_limit / GAS_LIMIT_BOUND_DIVISOR).max(1);
        if header.gas_limit < MIN_GAS_LIMIT
            || header.gas_limit.abs_diff(parent_limit) > drift
        {
            return Err(invalid(format!(
                "gas limit {} outside the legal band around {parent_limit}",
                header.gas_limit
            )));
        }
        if header.gas_used > header.gas_limit {
            return Err(invalid("gas used above the limit"));
        }
        if header.features.has_unknown_bits() {
            return Err(invalid("unknown header feature bits"));
        }
        if header.features.is_delegated() && header.number() < self.fork.vip191 {
            return Err(invalid("delegation feature before its fork"));
        }
        if block.compute_txs_root() != header.txs_root {
            return Err(invalid("txs root mismatch"));
        }
        Ok(())
    }

    fn execute_body(
        &self,
        parent: &BlockSummary,
        block: &Block,
        supported: Features,
        runtime: &mut Runtime,
    ) -> Result<(Vec<Receipt>, u64, Features), ValidationError> {
        let header = block.header();
        let number = header.number();
        let chain = self.repo.new_chain(parent.id());

        let mut receipts = Vec::with_capacity(block.txs().len());
        let mut gas_used = 0u64;
        let mut features = Features::default();
        let mut seen: HashMap<TxId, bool> = HashMap::new();

        for tx in block.txs() {
            if tx.chain_tag != self.repo.chain_tag() {
                return Err(invalid("tx chain tag mismatch"));
            }
            if tx.features.has_unknown_bits() {
                return Err(invalid("tx reserved feature bits set"));
            }
            if tx.features.is_delegated() && !supported.is_delegated() {
                return Err(invalid("delegated tx before its fork"));
            }
            if tx.is_expired(number) {
                return Err(invalid("expired tx"));
            }
            if tx.block_ref_number() > parent.number() {
                return Err(invalid("tx block ref ahead of parent"));
            }
            let id = tx
                .id()
                .map_err(|e| invalid(format!("unrecoverable tx signature: {e}")))?;
            if seen.contains_key(&id) || chain.contains_tx(id)? {
                return Err(invalid("duplicate tx"));
            }
            if number >= self.fork.blocklist {
                let origin = tx
                    .origin()
                    .map_err(|e| invalid(format!("unrecoverable tx signature: {e}")))?;
                if Blocklist::contains(runtime.state(), origin)? {
                    return Err(invalid("block-listed origin"));
                }
            }
            if let Some(dep) = tx.depends_on {
                let reverted = match seen.get(&dep) {
                    Some(reverted) => Some(*reverted),
                    None => chain.find_tx(dep)?.map(|meta| meta.reverted),
                };
                match reverted {
                    None => return Err(invalid("dependency not mined")),
                    Some(true) => return Err(invalid("dependency reverted")),
                    Some(false) => {}
                }
            }

            let receipt = runtime
                .execute_transaction(tx)
                .map_err(|e| invalid(format!("unexecutable tx: {e}")))?;
            gas_used += receipt.gas_used;
            features = features.union(tx.features);
            seen.insert(id, receipt.reverted);
            receipts.push(receipt);
        }
        Ok((receipts, gas_used, features))
    }

    fn supported_features(&self, number: u32) -> Features {
        let mut features = Features::default();
        if number >= self.fork.vip191 {
            features.set_delegated(true);
        }
        features
    }
}
