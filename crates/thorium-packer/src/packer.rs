//! The flow factory: resolves the proposer set, the beneficiary and the
//! gas-limit policy, schedules a slot and hands back a [`Flow`] ready to
//! adopt transactions.

use crate::flow::Flow;
use crate::sched::{Scheduler, SchedulerError, Proposer};
use crate::sched::{SchedulerV1, SchedulerV2};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use thorium_state::builtins::{
    Authority, Params, KEY_BASE_GAS_PRICE, KEY_ENDORSEMENT, KEY_MAX_BLOCK_PROPOSERS,
};
use thorium_state::{BlockContext, Runtime, StateError, Stater};
use thorium_storage::{BlockSummary, ChainRepository};
use thorium_types::constants::{
    GAS_LIMIT_BOUND_DIVISOR, INITIAL_BASE_GAS_PRICE, MAX_BLOCK_PROPOSERS, MIN_GAS_LIMIT,
};
use thorium_types::crypto::blake2b256;
use thorium_types::{Address, Features, ForkConfig, U256};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// This signer gets no slot right now; retry on the next tick.
    #[error("not scheduled")]
    NotScheduled,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("storage: {0}")]
    Storage(#[from] thorium_storage::StorageError),
}

pub struct Packer {
    stater: Stater,
    repo: Arc<ChainRepository>,
    signer: Address,
    beneficiary: Option<Address>,
    fork: ForkConfig,
    target_gas_limit: AtomicU64,
    block_interval: u64,
    pack_lock: Arc<Mutex<()>>,
}

impl Packer {
    pub fn new(
        stater: Stater,
        repo: Arc<ChainRepository>,
        signer: Address,
        beneficiary: Option<Address>,
        fork: ForkConfig,
        target_gas_limit: u64,
        block_interval: u64,
    ) -> Self {
        Self {
            stater,
            repo,
            signer,
            beneficiary,
            fork,
            target_gas_limit: AtomicU64::new(target_gas_limit),
            block_interval,
            pack_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    /// Zero keeps the parent's limit; adaptive callers feed suggestions
    /// here before scheduling.
    pub fn set_target_gas_limit(&self, target: u64) {
        self.target_gas_limit.store(target, Ordering::Relaxed);
    }

    /// The consensus path: full PoA scheduling against `parent`.
    pub fn schedule(&self, parent: &BlockSummary, now: u64) -> Result<Flow, ScheduleError> {
        let mut state = self.stater.new_state(parent.header.state_root);

        let endorsement = Params::get_or(&state, KEY_ENDORSEMENT, U256::ZERO)?;
        let max_proposers =
            Params::get_or(&state, KEY_MAX_BLOCK_PROPOSERS, U256::from(MAX_BLOCK_PROPOSERS))?
                .min(U256::from(u64::MAX))
                .to::<u64>();

        let rows = Authority::rows(&state)?;
        let mut proposers = Vec::new();
        let mut own_endorsor = None;
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
            if row.signer == self.signer {
                own_endorsor = Some(row.endorsor);
            }
        }

        let beneficiary = match self.beneficiary {
            Some(addr) => addr,
            None => own_endorsor.unwrap_or(self.signer),
        };

        let number = parent.number() + 1;
        let parent_id = parent.id();
        let scheduler = if number >= self.fork.vip214 {
            let seed = blake2b256(&[parent_id.as_bytes()]);
            Scheduler::V2(
                SchedulerV2::new(
                    self.signer,
                    &proposers,
                    parent.number(),
                    parent.header.timestamp,
                    self.block_interval,
                    seed,
                )
                .map_err(not_scheduled)?,
            )
        } else {
            Scheduler::V1(
                SchedulerV1::new(
                    self.signer,
                    &proposers,
                    parent.number(),
                    parent.header.timestamp,
                    self.block_interval,
                )
                .map_err(not_scheduled)?,
            )
        };

        let new_block_time = scheduler.schedule(now).map_err(not_scheduled)?;
        let (updates, score) = scheduler.updates(new_block_time);
        for update in &updates {
            Authority::update_active(&mut state, update.address, update.active)?;
        }
        debug!(
            number,
            when = new_block_time,
            score,
            demoted = updates.len(),
            "proposal slot scheduled"
        );

        let base_gas_price =
            Params::get_or(&state, KEY_BASE_GAS_PRICE, INITIAL_BASE_GAS_PRICE)?;
        let context = BlockContext {
            chain_tag: self.repo.chain_tag(),
            beneficiary,
            signer: self.signer,
            number,
            time: new_block_time,
            gas_limit: self.resolve_gas_limit(parent.header.gas_limit),
            total_score: parent.header.total_score + score,
            features: self.block_features(number),
            base_gas_price,
        };
        let runtime = Runtime::new(state, context);
        Ok(Flow::new(
            parent.header.clone(),
            self.repo.new_chain(parent_id),
            self.fork,
            runtime,
            self.pack_lock.clone(),
        ))
    }

    /// The solo/test path: a structurally valid flow outside PoA consensus.
    pub fn mock(
        &self,
        parent: &BlockSummary,
        time: u64,
        gas_limit: u64,
    ) -> Result<Flow, ScheduleError> {
        let state = self.stater.new_state(parent.header.state_root);
        let base_gas_price =
            Params::get_or(&state, KEY_BASE_GAS_PRICE, INITIAL_BASE_GAS_PRICE)?;
        let number = parent.number() + 1;
        let context = BlockContext {
            chain_tag: self.repo.chain_tag(),
            beneficiary: self.beneficiary.unwrap_or(self.signer),
            signer: self.signer,
            number,
            time,
            gas_limit,
            total_score: parent.header.total_score + 1,
            features: self.block_features(number),
            base_gas_price,
        };
        let runtime = Runtime::new(state, context);
        Ok(Flow::new(
            parent.header.clone(),
            self.repo.new_chain(parent.id()),
            self.fork,
            runtime,
            self.pack_lock.clone(),
        ))
    }

    /// Clamps the configured target into the legal drift band around the
    /// parent's limit; zero target inherits the parent.
    fn resolve_gas_limit(&self, parent_gas_limit: u64) -> u64 {
        let target = self.target_gas_limit.load(Ordering::Relaxed);
        if target == 0 {
            return parent_gas_limit;
        }
        let drift = (parent_gas_limit / GAS_LIMIT_BOUND_DIVISOR).max(1);
        target
            .clamp(
                parent_gas_limit.saturating_sub(drift),
                parent_gas_limit.saturating_add(drift),
            )
            .max(MIN_GAS_LIMIT)
    }

    fn block_features(&self, number: u32) -> Features {
        let mut features = Features::default();
        if number >= self.fork.vip191 {
            features.set_delegated(true);
        }
        features
    }
}

/// Both scheduler failure modes surface as "not scheduled"; an
/// unauthorized signer simply retries when the registry changes.
fn not_scheduled(_: SchedulerError) -> ScheduleError {
    ScheduleError::NotScheduled
}

#[cfg(test)]
#[path = "packer_test.rs"]
mod packer_test;
