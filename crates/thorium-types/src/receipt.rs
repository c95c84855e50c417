//! Execution receipts and their per-clause outputs.

use crate::merkle::merkle_root;
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// An event log raised during clause execution.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Event {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// A value movement recorded during clause execution.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Transfer {
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
}

/// Logs produced by one clause.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Output {
    pub events: Vec<Event>,
    pub transfers: Vec<Transfer>,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Receipt {
    pub gas_used: u64,
    pub gas_payer: Address,
    /// Total charged for gas.
    pub paid: U256,
    /// Share of `paid` credited to the block beneficiary.
    pub reward: U256,
    pub reverted: bool,
    /// One output per clause; empty when reverted.
    pub outputs: Vec<Output>,
}

/// Merkle root over the RLP encoding of each receipt.
pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    merkle_root(receipts.iter().map(alloy_rlp::encode))
}
