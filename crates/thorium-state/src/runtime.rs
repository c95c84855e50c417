//! Transaction execution against a per-flow working state. Clauses move
//! native value; gas is charged intrinsically and settled with the gas
//! payer, with the priority share of the price rewarding the beneficiary.

use crate::state::State;
use crate::StateError;
use thiserror::Error;
use thorium_types::transaction::TxError;
use thorium_types::{Address, Features, Receipt, Transaction, U256};
use thorium_types::receipt::{Output, Transfer};
use tracing::trace;

/// Numerator over 10 of the paid amount credited to the beneficiary.
const REWARD_NUMERATOR: u64 = 3;

/// Structural execution failures; a revert is not one of these.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("gas {provided} below intrinsic {intrinsic}")]
    IntrinsicGasExceedsProvided { provided: u64, intrinsic: u64 },
    #[error("gas payer {payer} cannot cover the gas prepayment")]
    UnableToPayGas { payer: Address },
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// The header-shaped context a candidate block executes under.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub chain_tag: u8,
    pub beneficiary: Address,
    pub signer: Address,
    pub number: u32,
    pub time: u64,
    pub gas_limit: u64,
    pub total_score: u64,
    pub features: Features,
    pub base_gas_price: U256,
}

/// Executes transactions for one candidate block.
pub struct Runtime {
    state: State,
    context: BlockContext,
}

impl Runtime {
    pub fn new(state: State, context: BlockContext) -> Self {
        Self { state, context }
    }

    pub fn context(&self) -> &BlockContext {
        &self.context
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn into_state(self) -> State {
        self.state
    }

    /// Runs one transaction. A structural failure leaves the state exactly
    /// as it was; a clause failure settles gas and returns a reverted
    /// receipt.
    pub fn execute_transaction(
        &mut self,
        tx: &Transaction,
    ) -> std::result::Result<Receipt, ExecutionError> {
        let intrinsic = tx.intrinsic_gas()?;
        if tx.gas < intrinsic {
            return Err(ExecutionError::IntrinsicGasExceedsProvided {
                provided: tx.gas,
                intrinsic,
            });
        }
        let origin = tx.origin()?;
        let payer = tx.gas_payer()?;
        let price = tx.gas_price(self.context.base_gas_price);
        let prepaid = price.saturating_mul(U256::from(tx.gas));

        let outer = self.state.new_checkpoint();
        if !self.state.sub_balance(payer, prepaid)? {
            self.state.revert_to(outer);
            return Err(ExecutionError::UnableToPayGas { payer });
        }

        let clause_point = self.state.new_checkpoint();
        let mut outputs = Vec::with_capacity(tx.clauses.len());
        let mut reverted = false;
        for clause in &tx.clauses {
            match clause.to {
                Some(recipient) => {
                    if !self.state.sub_balance(origin, clause.value)? {
                        reverted = true;
                        break;
                    }
                    self.state.add_balance(recipient, clause.value)?;
                    let mut output = Output::default();
                    if !clause.value.is_zero() {
                        output.transfers.push(Transfer {
                            sender: origin,
                            recipient,
                            amount: clause.value,
                        });
                    }
                    outputs.push(output);
                }
                None => {
                    // Creation clauses carry no native execution here; a
                    // funded creation cannot settle and reverts.
                    if !clause.value.is_zero() {
                        reverted = true;
                        break;
                    }
                    outputs.push(Output::default());
                }
            }
        }
        if reverted {
            self.state.revert_to(clause_point);
            outputs.clear();
        }

        // Gas settles regardless of the clause outcome.
        let gas_used = intrinsic;
        let refund = price.saturating_mul(U256::from(tx.gas - gas_used));
        self.state.add_balance(payer, refund)?;
        let paid = price.saturating_mul(U256::from(gas_used));
        let reward = paid * U256::from(REWARD_NUMERATOR) / U256::from(10u8);
        self.state.add_balance(self.context.beneficiary, reward)?;

        trace!(
            tx = %tx.signing_hash(),
            gas_used,
            reverted,
            "transaction executed"
        );
        Ok(Receipt {
            gas_used,
            gas_payer: payer,
            paid,
            reward,
            reverted,
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Stater;
    use crate::store::tests::mem_node_store;
    use crate::trie::EMPTY_ROOT;
    use secp256k1::SecretKey;
    use std::sync::Arc;
    use thorium_types::crypto::address_of;
    use thorium_types::transaction::{Clause, Pricing};
    use thorium_types::Bytes;

    fn context(beneficiary: Address) -> BlockContext {
        BlockContext {
            chain_tag: 1,
            beneficiary,
            signer: Address::repeat_byte(0x51),
            number: 1,
            time: 10,
            gas_limit: 10_000_000,
            total_score: 1,
            features: Features::default(),
            base_gas_price: U256::from(1_000u64),
        }
    }

    fn transfer(key: &SecretKey, to: Address, value: u64, coef: u8) -> Transaction {
        Transaction {
            chain_tag: 1,
            block_ref: [0; 8],
            expiration: 100,
            clauses: vec![Clause::transfer(to, U256::from(value))],
            pricing: Pricing::Legacy {
                gas_price_coef: coef,
            },
            gas: 100_000,
            depends_on: None,
            nonce: 0,
            features: Features::default(),
            signature: Bytes::new(),
        }
        .sign(key)
    }

    fn runtime_with_funds(key: &SecretKey, funds: u64) -> Runtime {
        let stater = Stater::new(Arc::new(mem_node_store()));
        let mut state = stater.new_state(EMPTY_ROOT);
        state
            .set_balance(address_of(key), U256::from(funds))
            .unwrap();
        Runtime::new(state, context(Address::repeat_byte(0xbe)))
    }

    #[test]
    fn successful_transfer_moves_value_and_settles_gas() {
        let key = SecretKey::new(&mut rand::thread_rng());
        let origin = address_of(&key);
        let recipient = Address::repeat_byte(2);
        let mut runtime = runtime_with_funds(&key, 1_000_000_000);

        let tx = transfer(&key, recipient, 10_000, 0);
        let receipt = runtime.execute_transaction(&tx).unwrap();

        assert!(!receipt.reverted);
        assert_eq!(receipt.gas_used, tx.intrinsic_gas().unwrap());
        assert_eq!(receipt.outputs.len(), 1);
        assert_eq!(receipt.outputs[0].transfers[0].amount, U256::from(10_000u64));
        assert_eq!(
            runtime.state().balance(recipient).unwrap(),
            U256::from(10_000u64)
        );
        let expected_paid =
            U256::from(1_000u64) * U256::from(receipt.gas_used);
        assert_eq!(receipt.paid, expected_paid);
        assert_eq!(receipt.reward, expected_paid * U256::from(3u8) / U256::from(10u8));
        assert_eq!(
            runtime.state().balance(Address::repeat_byte(0xbe)).unwrap(),
            receipt.reward
        );
        assert_eq!(
            runtime.state().balance(origin).unwrap(),
            U256::from(1_000_000_000u64) - U256::from(10_000u64) - expected_paid
        );
    }

    #[test]
    fn insufficient_value_reverts_but_still_charges_gas() {
        let key = SecretKey::new(&mut rand::thread_rng());
        let origin = address_of(&key);
        // Enough for gas, nowhere near enough for the transfer.
        let mut runtime = runtime_with_funds(&key, 100_000_000);

        let tx = transfer(&key, Address::repeat_byte(2), u64::MAX, 0);
        let receipt = runtime.execute_transaction(&tx).unwrap();

        assert!(receipt.reverted);
        assert!(receipt.outputs.is_empty());
        assert_eq!(
            runtime.state().balance(Address::repeat_byte(2)).unwrap(),
            U256::ZERO
        );
        assert_eq!(
            runtime.state().balance(origin).unwrap(),
            U256::from(100_000_000u64) - receipt.paid
        );
    }

    #[test]
    fn unpayable_gas_is_structural_and_leaves_state_untouched() {
        let key = SecretKey::new(&mut rand::thread_rng());
        let origin = address_of(&key);
        let mut runtime = runtime_with_funds(&key, 10);

        let tx = transfer(&key, Address::repeat_byte(2), 1, 0);
        let err = runtime.execute_transaction(&tx).unwrap_err();
        assert!(matches!(err, ExecutionError::UnableToPayGas { .. }));
        assert_eq!(runtime.state().balance(origin).unwrap(), U256::from(10u64));
    }

    #[test]
    fn gas_below_intrinsic_is_structural() {
        let key = SecretKey::new(&mut rand::thread_rng());
        let mut runtime = runtime_with_funds(&key, 1_000_000_000);
        let mut tx = transfer(&key, Address::repeat_byte(2), 1, 0);
        tx.gas = 1_000;
        let tx = tx.sign(&key);
        assert!(matches!(
            runtime.execute_transaction(&tx).unwrap_err(),
            ExecutionError::IntrinsicGasExceedsProvided { .. }
        ));
    }

    #[test]
    fn delegated_tx_charges_the_delegator() {
        let origin_key = SecretKey::new(&mut rand::thread_rng());
        let delegator_key = SecretKey::new(&mut rand::thread_rng());
        let origin = address_of(&origin_key);
        let delegator = address_of(&delegator_key);

        let stater = Stater::new(Arc::new(mem_node_store()));
        let mut state = stater.new_state(EMPTY_ROOT);
        state.set_balance(origin, U256::from(10_000u64)).unwrap();
        state
            .set_balance(delegator, U256::from(1_000_000_000u64))
            .unwrap();
        let mut runtime = Runtime::new(state, context(Address::repeat_byte(0xbe)));

        let mut tx = transfer(&origin_key, Address::repeat_byte(2), 5_000, 0);
        tx.features.set_delegated(true);
        let tx = tx.sign_delegated(&origin_key, &delegator_key);

        let receipt = runtime.execute_transaction(&tx).unwrap();
        assert!(!receipt.reverted);
        assert_eq!(receipt.gas_payer, delegator);
        // The origin only lost the transferred value.
        assert_eq!(
            runtime.state().balance(origin).unwrap(),
            U256::from(5_000u64)
        );
    }
}
