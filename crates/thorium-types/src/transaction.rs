//! Transactions: multi-clause, legacy or dynamic-fee priced, optionally
//! fee-delegated.

use crate::constants::{
    CLAUSE_GAS, CLAUSE_GAS_CONTRACT_CREATION, TX_DATA_NON_ZERO_GAS, TX_DATA_ZERO_GAS, TX_GAS,
};
use crate::crypto::{self, blake2b256, CryptoError, SIGNATURE_LEN};
use crate::features::Features;
use crate::ids::TxId;
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_rlp::{Decodable, Encodable};
use bytes::Buf;
use secp256k1::SecretKey;
use thiserror::Error;

/// Type tag of dynamic-fee transactions on the wire.
const DYNAMIC_FEE_TX_TYPE: u8 = 0x51;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("intrinsic gas overflows")]
    IntrinsicGasOverflow,
    #[error("unsupported transaction type {0:#x}")]
    UnsupportedType(u8),
    #[error("reserved field not trimmed")]
    ReservedNotTrimmed,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("rlp: {0}")]
    Rlp(#[from] alloy_rlp::Error),
}

/// A single call or transfer inside a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clause {
    /// Target account, or none for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

impl Clause {
    pub fn transfer(to: Address, value: U256) -> Self {
        Self {
            to: Some(to),
            value,
            data: Bytes::new(),
        }
    }
}

impl Encodable for Clause {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let to_len = match &self.to {
            Some(addr) => addr.length(),
            None => 1,
        };
        let payload_length = to_len + self.value.length() + self.data.length();
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(out);
        match &self.to {
            Some(addr) => addr.encode(out),
            None => out.put_u8(alloy_rlp::EMPTY_STRING_CODE),
        }
        self.value.encode(out);
        self.data.encode(out);
    }

    fn length(&self) -> usize {
        let to_len = match &self.to {
            Some(addr) => addr.length(),
            None => 1,
        };
        let payload_length = to_len + self.value.length() + self.data.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Clause {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = alloy_rlp::Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let mut payload = &buf[..header.payload_length];
        buf.advance(header.payload_length);

        let to_bytes = Bytes::decode(&mut payload)?;
        let to = match to_bytes.len() {
            0 => None,
            20 => Some(Address::from_slice(&to_bytes)),
            n => return Err(alloy_rlp::Error::ListLengthMismatch { expected: 20, got: n }),
        };
        let value = U256::decode(&mut payload)?;
        let data = Bytes::decode(&mut payload)?;
        Ok(Self { to, value, data })
    }
}

/// How a transaction bids for gas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pricing {
    /// Fixed-schedule pricing: the bid is `base + base × coef / 255`.
    Legacy { gas_price_coef: u8 },
    /// Market pricing with a fee cap and a priority component.
    Dynamic {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub chain_tag: u8,
    /// 8-byte prefix of a recent block id; the top 4 bytes are its number.
    pub block_ref: [u8; 8],
    /// Lifetime in blocks counted from the referenced block.
    pub expiration: u32,
    pub clauses: Vec<Clause>,
    pub pricing: Pricing,
    pub gas: u64,
    pub depends_on: Option<TxId>,
    pub nonce: u64,
    pub features: Features,
    /// 65 bytes, or 130 when fee-delegated (origin ‖ delegator).
    pub signature: Bytes,
}

impl Transaction {
    pub fn tx_type(&self) -> u8 {
        match self.pricing {
            Pricing::Legacy { .. } => 0x00,
            Pricing::Dynamic { .. } => DYNAMIC_FEE_TX_TYPE,
        }
    }

    /// Block number the `block_ref` points at.
    pub fn block_ref_number(&self) -> u32 {
        u32::from_be_bytes(self.block_ref[..4].try_into().expect("4-byte prefix"))
    }

    /// Whether the tx is no longer adoptable at `block_num`.
    pub fn is_expired(&self, block_num: u32) -> bool {
        u64::from(self.block_ref_number()) + u64::from(self.expiration) < u64::from(block_num)
    }

    /// Hash the origin signs.
    pub fn signing_hash(&self) -> B256 {
        let mut payload = Vec::new();
        self.encode_payload(false, &mut payload);
        match self.pricing {
            Pricing::Legacy { .. } => blake2b256(&[&payload]),
            Pricing::Dynamic { .. } => blake2b256(&[&[DYNAMIC_FEE_TX_TYPE], &payload]),
        }
    }

    /// Hash a gas-payer signs on behalf of `origin`.
    pub fn delegator_signing_hash(&self, origin: &Address) -> B256 {
        blake2b256(&[self.signing_hash().as_slice(), origin.as_slice()])
    }

    pub fn origin(&self) -> Result<Address, TxError> {
        let sig = self.origin_signature()?;
        Ok(crypto::recover_signer(&self.signing_hash(), sig)?)
    }

    /// The fee delegator, when the delegated feature is on.
    pub fn delegator(&self) -> Result<Option<Address>, TxError> {
        if !self.features.is_delegated() {
            return Ok(None);
        }
        if self.signature.len() != 2 * SIGNATURE_LEN {
            return Err(CryptoError::InvalidSignatureLength(self.signature.len()).into());
        }
        let origin = self.origin()?;
        let hash = self.delegator_signing_hash(&origin);
        Ok(Some(crypto::recover_signer(
            &hash,
            &self.signature[SIGNATURE_LEN..],
        )?))
    }

    /// The account charged for gas: the delegator when present, else origin.
    pub fn gas_payer(&self) -> Result<Address, TxError> {
        match self.delegator()? {
            Some(delegator) => Ok(delegator),
            None => self.origin(),
        }
    }

    /// Unique id: hash of the signing hash and the origin.
    pub fn id(&self) -> Result<TxId, TxError> {
        let origin = self.origin()?;
        Ok(TxId(blake2b256(&[
            self.signing_hash().as_slice(),
            origin.as_slice(),
        ])))
    }

    /// Gas consumed before any clause executes.
    pub fn intrinsic_gas(&self) -> Result<u64, TxError> {
        if self.clauses.is_empty() {
            return TX_GAS
                .checked_add(CLAUSE_GAS)
                .ok_or(TxError::IntrinsicGasOverflow);
        }
        let mut total = TX_GAS;
        for clause in &self.clauses {
            let clause_gas = if clause.to.is_some() {
                CLAUSE_GAS
            } else {
                CLAUSE_GAS_CONTRACT_CREATION
            };
            let data_cost = data_gas(&clause.data)?;
            total = total
                .checked_add(clause_gas)
                .and_then(|t| t.checked_add(data_cost))
                .ok_or(TxError::IntrinsicGasOverflow)?;
        }
        Ok(total)
    }

    /// The price this tx pays per gas unit given the network base price.
    pub fn gas_price(&self, base: U256) -> U256 {
        match &self.pricing {
            Pricing::Legacy { gas_price_coef } => {
                base + base * U256::from(*gas_price_coef) / U256::from(255u8)
            }
            Pricing::Dynamic { max_fee_per_gas, .. } => (*max_fee_per_gas).min(
                base.saturating_add(self.priority_gas_price(base)),
            ),
        }
    }

    /// The component of the price above the base, rewarded to the proposer.
    pub fn priority_gas_price(&self, base: U256) -> U256 {
        match &self.pricing {
            Pricing::Legacy { gas_price_coef } => {
                base * U256::from(*gas_price_coef) / U256::from(255u8)
            }
            Pricing::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => (*max_priority_fee_per_gas).min(max_fee_per_gas.saturating_sub(base)),
        }
    }

    /// Signs as origin, consuming and returning the tx.
    pub fn sign(mut self, key: &SecretKey) -> Self {
        self.signature = crypto::sign_hash(&self.signing_hash(), key).to_vec().into();
        self
    }

    /// Signs as origin and delegator; the delegated feature must be set.
    pub fn sign_delegated(mut self, origin: &SecretKey, delegator: &SecretKey) -> Self {
        debug_assert!(self.features.is_delegated());
        let origin_sig = crypto::sign_hash(&self.signing_hash(), origin);
        let origin_addr = crypto::address_of(origin);
        let delegator_sig =
            crypto::sign_hash(&self.delegator_signing_hash(&origin_addr), delegator);
        let mut sig = Vec::with_capacity(2 * SIGNATURE_LEN);
        sig.extend_from_slice(&origin_sig);
        sig.extend_from_slice(&delegator_sig);
        self.signature = sig.into();
        self
    }

    pub fn encoded_size(&self) -> usize {
        self.length()
    }

    fn origin_signature(&self) -> Result<&[u8], TxError> {
        let expected = if self.features.is_delegated() {
            2 * SIGNATURE_LEN
        } else {
            SIGNATURE_LEN
        };
        if self.signature.len() != expected {
            return Err(CryptoError::InvalidSignatureLength(self.signature.len()).into());
        }
        Ok(&self.signature[..SIGNATURE_LEN])
    }

    fn reserved_items(&self) -> Vec<Bytes> {
        if self.features.is_empty() {
            Vec::new()
        } else {
            vec![trim_be(self.features.0)]
        }
    }

    fn payload_length(&self, include_sig: bool) -> usize {
        let mut len = self.chain_tag.length()
            + u64::from_be_bytes(self.block_ref).length()
            + self.expiration.length()
            + self.clauses.length();
        len += match &self.pricing {
            Pricing::Legacy { gas_price_coef } => gas_price_coef.length(),
            Pricing::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => max_priority_fee_per_gas.length() + max_fee_per_gas.length(),
        };
        len += self.gas.length();
        len += match &self.depends_on {
            Some(id) => id.length(),
            None => 1,
        };
        len += self.nonce.length();
        len += self.reserved_items().length();
        if include_sig {
            len += self.signature.length();
        }
        len
    }

    fn encode_payload(&self, include_sig: bool, out: &mut Vec<u8>) {
        alloy_rlp::Header {
            list: true,
            payload_length: self.payload_length(include_sig),
        }
        .encode(out);
        self.chain_tag.encode(out);
        u64::from_be_bytes(self.block_ref).encode(out);
        self.expiration.encode(out);
        self.clauses.encode(out);
        match &self.pricing {
            Pricing::Legacy { gas_price_coef } => gas_price_coef.encode(out),
            Pricing::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                max_priority_fee_per_gas.encode(out);
                max_fee_per_gas.encode(out);
            }
        }
        self.gas.encode(out);
        match &self.depends_on {
            Some(id) => id.encode(out),
            None => out.push(alloy_rlp::EMPTY_STRING_CODE),
        }
        self.nonce.encode(out);
        self.reserved_items().encode(out);
        if include_sig {
            self.signature.encode(out);
        }
    }

    fn decode_payload(buf: &mut &[u8], dynamic: bool) -> Result<Self, alloy_rlp::Error> {
        let header = alloy_rlp::Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let mut payload = &buf[..header.payload_length];
        buf.advance(header.payload_length);

        let chain_tag = u8::decode(&mut payload)?;
        let block_ref = u64::decode(&mut payload)?.to_be_bytes();
        let expiration = u32::decode(&mut payload)?;
        let clauses = Vec::<Clause>::decode(&mut payload)?;
        let pricing = if dynamic {
            let max_priority_fee_per_gas = U256::decode(&mut payload)?;
            let max_fee_per_gas = U256::decode(&mut payload)?;
            Pricing::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }
        } else {
            Pricing::Legacy {
                gas_price_coef: u8::decode(&mut payload)?,
            }
        };
        let gas = u64::decode(&mut payload)?;
        let depends_bytes = Bytes::decode(&mut payload)?;
        let depends_on = match depends_bytes.len() {
            0 => None,
            32 => Some(TxId(B256::from_slice(&depends_bytes))),
            n => return Err(alloy_rlp::Error::ListLengthMismatch { expected: 32, got: n }),
        };
        let nonce = u64::decode(&mut payload)?;
        let reserved = Vec::<Bytes>::decode(&mut payload)?;
        let features = decode_reserved(&reserved)?;
        let signature = Bytes::decode(&mut payload)?;
        if !payload.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(Self {
            chain_tag,
            block_ref,
            expiration,
            clauses,
            pricing,
            gas,
            depends_on,
            nonce,
            features,
            signature,
        })
    }
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let mut payload = Vec::new();
        self.encode_payload(true, &mut payload);
        match self.pricing {
            Pricing::Legacy { .. } => out.put_slice(&payload),
            Pricing::Dynamic { .. } => {
                // Typed txs travel as a byte string: type tag ‖ payload.
                alloy_rlp::Header {
                    list: false,
                    payload_length: payload.len() + 1,
                }
                .encode(out);
                out.put_u8(DYNAMIC_FEE_TX_TYPE);
                out.put_slice(&payload);
            }
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length(true);
        let list_len = payload_length + alloy_rlp::length_of_length(payload_length);
        match self.pricing {
            Pricing::Legacy { .. } => list_len,
            Pricing::Dynamic { .. } => {
                let wrapped = list_len + 1;
                wrapped + alloy_rlp::length_of_length(wrapped)
            }
        }
    }
}

impl Decodable for Transaction {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let first = *buf.first().ok_or(alloy_rlp::Error::InputTooShort)?;
        if first >= alloy_rlp::EMPTY_LIST_CODE {
            return Self::decode_payload(buf, false);
        }
        let wrapped = Bytes::decode(buf)?;
        let (tag, rest) = wrapped
            .split_first()
            .ok_or(alloy_rlp::Error::InputTooShort)?;
        if *tag != DYNAMIC_FEE_TX_TYPE {
            return Err(alloy_rlp::Error::Custom("unsupported transaction type"));
        }
        let mut inner = rest;
        let tx = Self::decode_payload(&mut inner, true)?;
        if !inner.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(tx)
    }
}

fn data_gas(data: &[u8]) -> Result<u64, TxError> {
    let zeros = data.iter().filter(|b| **b == 0).count() as u64;
    let non_zeros = data.len() as u64 - zeros;
    zeros
        .checked_mul(TX_DATA_ZERO_GAS)
        .and_then(|z| {
            non_zeros
                .checked_mul(TX_DATA_NON_ZERO_GAS)
                .and_then(|nz| z.checked_add(nz))
        })
        .ok_or(TxError::IntrinsicGasOverflow)
}

fn trim_be(value: u32) -> Bytes {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(4);
    Bytes::copy_from_slice(&bytes[first..])
}

fn decode_reserved(items: &[Bytes]) -> Result<Features, alloy_rlp::Error> {
    match items {
        [] => Ok(Features::default()),
        [first] => {
            if first.is_empty() || first.len() > 4 || first[0] == 0 {
                return Err(alloy_rlp::Error::Custom("reserved field not trimmed"));
            }
            let mut bytes = [0u8; 4];
            bytes[4 - first.len()..].copy_from_slice(first);
            Ok(Features(u32::from_be_bytes(bytes)))
        }
        // Unused trailing reserved items must already be trimmed away.
        _ => Err(alloy_rlp::Error::Custom("reserved field not trimmed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::address_of;
    use rand::thread_rng;

    fn base_tx() -> Transaction {
        Transaction {
            chain_tag: 0x1a,
            block_ref: [0, 0, 0, 5, 1, 2, 3, 4],
            expiration: 32,
            clauses: vec![Clause::transfer(Address::repeat_byte(7), U256::from(10_000u64))],
            pricing: Pricing::Legacy { gas_price_coef: 128 },
            gas: 21_000,
            depends_on: None,
            nonce: 12345,
            features: Features::default(),
            signature: Bytes::new(),
        }
    }

    #[test]
    fn legacy_round_trip() {
        let key = SecretKey::new(&mut thread_rng());
        let tx = base_tx().sign(&key);
        let mut out = Vec::new();
        tx.encode(&mut out);
        assert_eq!(out.len(), tx.length());
        let decoded = Transaction::decode(&mut out.as_slice()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.origin().unwrap(), address_of(&key));
    }

    #[test]
    fn dynamic_round_trip() {
        let key = SecretKey::new(&mut thread_rng());
        let mut tx = base_tx();
        tx.pricing = Pricing::Dynamic {
            max_fee_per_gas: U256::from(2_000u64),
            max_priority_fee_per_gas: U256::from(100u64),
        };
        tx.depends_on = Some(TxId(B256::repeat_byte(9)));
        let tx = tx.sign(&key);
        let mut out = Vec::new();
        tx.encode(&mut out);
        assert_eq!(out.len(), tx.length());
        let decoded = Transaction::decode(&mut out.as_slice()).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn delegated_signature_recovers_both_parties() {
        let origin = SecretKey::new(&mut thread_rng());
        let delegator = SecretKey::new(&mut thread_rng());
        let mut tx = base_tx();
        tx.features.set_delegated(true);
        let tx = tx.sign_delegated(&origin, &delegator);
        assert_eq!(tx.origin().unwrap(), address_of(&origin));
        assert_eq!(tx.delegator().unwrap(), Some(address_of(&delegator)));
        assert_eq!(tx.gas_payer().unwrap(), address_of(&delegator));
    }

    #[test]
    fn id_binds_signer_and_content() {
        let a = SecretKey::new(&mut thread_rng());
        let b = SecretKey::new(&mut thread_rng());
        let id_a = base_tx().sign(&a).id().unwrap();
        let id_b = base_tx().sign(&b).id().unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn block_ref_and_expiration() {
        let tx = base_tx();
        assert_eq!(tx.block_ref_number(), 5);
        assert!(!tx.is_expired(37));
        assert!(tx.is_expired(38));
    }

    #[test]
    fn intrinsic_gas_counts_clauses_and_data() {
        let mut tx = base_tx();
        assert_eq!(tx.intrinsic_gas().unwrap(), TX_GAS + CLAUSE_GAS);
        tx.clauses = vec![Clause {
            to: None,
            value: U256::ZERO,
            data: vec![0u8, 1u8].into(),
        }];
        assert_eq!(
            tx.intrinsic_gas().unwrap(),
            TX_GAS + CLAUSE_GAS_CONTRACT_CREATION + TX_DATA_ZERO_GAS + TX_DATA_NON_ZERO_GAS
        );
        tx.clauses = vec![];
        assert_eq!(tx.intrinsic_gas().unwrap(), TX_GAS + CLAUSE_GAS);
    }

    #[test]
    fn legacy_price_follows_coefficient() {
        let base = U256::from(1_000u64);
        let mut tx = base_tx();
        tx.pricing = Pricing::Legacy { gas_price_coef: 0 };
        assert_eq!(tx.gas_price(base), base);
        tx.pricing = Pricing::Legacy { gas_price_coef: 255 };
        assert_eq!(tx.gas_price(base), base * U256::from(2u8));
    }

    #[test]
    fn dynamic_priority_is_capped_by_fee_cap() {
        let base = U256::from(1_000u64);
        let mut tx = base_tx();
        tx.pricing = Pricing::Dynamic {
            max_fee_per_gas: U256::from(1_100u64),
            max_priority_fee_per_gas: U256::from(500u64),
        };
        assert_eq!(tx.priority_gas_price(base), U256::from(100u64));
        assert_eq!(tx.gas_price(base), U256::from(1_100u64));
    }

    #[test]
    fn untrimmed_reserved_is_rejected() {
        // Trailing unused items and non-canonical feature bytes are invalid.
        assert!(decode_reserved(&[Bytes::from(vec![1u8]), Bytes::new()]).is_err());
        assert!(decode_reserved(&[Bytes::from(vec![0u8, 1u8])]).is_err());
        assert!(decode_reserved(&[Bytes::new()]).is_err());
        assert_eq!(decode_reserved(&[]).unwrap(), Features::default());
        assert_eq!(
            decode_reserved(&[Bytes::from(vec![1u8])]).unwrap(),
            Features(1)
        );
    }
}
