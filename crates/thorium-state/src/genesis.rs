//! Genesis construction: seeds accounts and builtin registries, commits
//! the initial state and shapes block zero.

use crate::builtins::{Authority, AuthorityRow, Params, KEY_BASE_GAS_PRICE, KEY_ENDORSEMENT, KEY_MAX_BLOCK_PROPOSERS};
use crate::state::Stater;
use crate::trie::EMPTY_ROOT;
use crate::Result;
use secp256k1::SecretKey;
use thorium_types::block::txs_root;
use thorium_types::constants::{INITIAL_BASE_GAS_PRICE, INITIAL_GAS_LIMIT, MAX_BLOCK_PROPOSERS};
use thorium_types::crypto::{address_of, blake2b256};
use thorium_types::receipt::receipts_root;
use thorium_types::{Address, Block, BlockId, Bytes, Features, Header, B256, U256};

/// A dev-network key pair.
pub struct DevAccount {
    pub key: SecretKey,
    pub address: Address,
}

/// Deterministic dev accounts, the same on every run.
pub fn dev_accounts() -> Vec<DevAccount> {
    (0u8..10)
        .map(|index| {
            let seed = blake2b256(&[b"thorium-dev-account", &[index]]);
            let key = SecretKey::from_slice(seed.as_slice()).expect("seed in curve order");
            let address = address_of(&key);
            DevAccount { key, address }
        })
        .collect()
}

pub struct GenesisBuilder {
    launch_time: u64,
    gas_limit: u64,
    accounts: Vec<(Address, U256)>,
    authority: Vec<AuthorityRow>,
    endorsement: U256,
    max_block_proposers: u64,
    base_gas_price: U256,
}

impl GenesisBuilder {
    pub fn new(launch_time: u64) -> Self {
        Self {
            launch_time,
            gas_limit: INITIAL_GAS_LIMIT,
            accounts: Vec::new(),
            authority: Vec::new(),
            endorsement: U256::ZERO,
            max_block_proposers: MAX_BLOCK_PROPOSERS,
            base_gas_price: INITIAL_BASE_GAS_PRICE,
        }
    }

    /// The solo preset: ten funded dev accounts, the first one registered
    /// as the sole proposer backed by itself.
    pub fn dev_net(launch_time: u64) -> Self {
        let mut builder = Self::new(launch_time);
        let accounts = dev_accounts();
        for account in &accounts {
            builder = builder.fund(
                account.address,
                U256::from(1_000_000u64) * U256::from(10u64).pow(U256::from(18u8)),
            );
        }
        let first = accounts[0].address;
        builder.authority(first, first, B256::ZERO)
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn fund(mut self, address: Address, balance: U256) -> Self {
        self.accounts.push((address, balance));
        self
    }

    pub fn authority(mut self, signer: Address, endorsor: Address, identity: B256) -> Self {
        self.authority.push(AuthorityRow {
            signer,
            endorsor,
            identity,
            active: true,
        });
        self
    }

    pub fn endorsement(mut self, endorsement: U256) -> Self {
        self.endorsement = endorsement;
        self
    }

    pub fn base_gas_price(mut self, price: U256) -> Self {
        self.base_gas_price = price;
        self
    }

    /// Commits the genesis state through `stater` and returns block zero.
    pub fn build(&self, stater: &Stater) -> Result<Block> {
        let mut state = stater.new_state(EMPTY_ROOT);
        for (address, balance) in &self.accounts {
            state.set_balance(*address, *balance)?;
        }
        Params::set(&mut state, KEY_ENDORSEMENT, self.endorsement);
        Params::set(
            &mut state,
            KEY_MAX_BLOCK_PROPOSERS,
            U256::from(self.max_block_proposers),
        );
        Params::set(&mut state, KEY_BASE_GAS_PRICE, self.base_gas_price);
        Authority::set_rows(&mut state, &self.authority)?;
        let state_root = state.stage(0)?.commit()?;

        let header = Header {
            parent_id: BlockId::new(u32::MAX, B256::ZERO),
            timestamp: self.launch_time,
            gas_limit: self.gas_limit,
            beneficiary: Address::ZERO,
            gas_used: 0,
            total_score: 0,
            txs_root: txs_root(&[]),
            state_root,
            receipts_root: receipts_root(&[]),
            features: Features::default(),
            signature: Bytes::new(),
        };
        Ok(Block::new(header, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins;
    use crate::store::tests::mem_node_store;
    use std::sync::Arc;

    #[test]
    fn dev_accounts_are_stable_across_calls() {
        let a = dev_accounts();
        let b = dev_accounts();
        assert_eq!(a.len(), 10);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.address, y.address);
        }
    }

    #[test]
    fn dev_net_genesis_funds_accounts_and_seeds_builtins() {
        let stater = Stater::new(Arc::new(mem_node_store()));
        let genesis = GenesisBuilder::dev_net(1_000).build(&stater).unwrap();
        assert_eq!(genesis.number(), 0);
        assert_eq!(genesis.header().timestamp, 1_000);

        let state = stater.new_state(genesis.header().state_root);
        for account in dev_accounts() {
            assert!(state.balance(account.address).unwrap() > U256::ZERO);
        }
        let rows = builtins::Authority::rows(&state).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].signer, dev_accounts()[0].address);
        assert_eq!(
            builtins::Params::get(&state, KEY_BASE_GAS_PRICE).unwrap(),
            Some(INITIAL_BASE_GAS_PRICE)
        );
    }

    #[test]
    fn same_configuration_same_genesis_id() {
        let stater_a = Stater::new(Arc::new(mem_node_store()));
        let stater_b = Stater::new(Arc::new(mem_node_store()));
        let a = GenesisBuilder::dev_net(1_000).build(&stater_a).unwrap();
        let b = GenesisBuilder::dev_net(1_000).build(&stater_b).unwrap();
        assert_eq!(a.id(), b.id());

        let c = GenesisBuilder::dev_net(2_000).build(&stater_a).unwrap();
        assert_ne!(a.id(), c.id());
    }
}
