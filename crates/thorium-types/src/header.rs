//! Block headers and their identity/signature rules.

use crate::crypto::{self, blake2b256, CryptoError};
use crate::features::Features;
use crate::ids::BlockId;
use alloy_primitives::{Address, Bytes, B256};
use alloy_rlp::{Decodable, Encodable};
use bytes::Buf;
use secp256k1::SecretKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub parent_id: BlockId,
    /// Unix seconds; always on the slot cadence relative to genesis.
    pub timestamp: u64,
    pub gas_limit: u64,
    pub beneficiary: Address,
    pub gas_used: u64,
    /// Monotone fork-choice weight accumulated along the chain.
    pub total_score: u64,
    pub txs_root: B256,
    pub state_root: B256,
    pub receipts_root: B256,
    pub features: Features,
    pub signature: Bytes,
}

impl Header {
    /// Height, derived from the parent id. The genesis parent id carries
    /// `u32::MAX` in its number bytes so genesis itself is number 0.
    pub fn number(&self) -> u32 {
        self.parent_id.number().wrapping_add(1)
    }

    /// Block id: hash of the signed header with the number spliced into the
    /// top 4 bytes.
    pub fn id(&self) -> BlockId {
        let mut out = Vec::new();
        self.encode(&mut out);
        BlockId::new(self.number(), blake2b256(&[&out]))
    }

    /// Hash the proposer signs.
    pub fn signing_hash(&self) -> B256 {
        let mut out = Vec::new();
        self.encode_unsigned(&mut out);
        blake2b256(&[&out])
    }

    pub fn signer(&self) -> Result<Address, CryptoError> {
        crypto::recover_signer(&self.signing_hash(), &self.signature)
    }

    pub fn sign(mut self, key: &SecretKey) -> Self {
        self.signature = crypto::sign_hash(&self.signing_hash(), key).to_vec().into();
        self
    }

    fn unsigned_payload_length(&self) -> usize {
        self.parent_id.length()
            + self.timestamp.length()
            + self.gas_limit.length()
            + self.beneficiary.length()
            + self.gas_used.length()
            + self.total_score.length()
            + self.txs_root.length()
            + self.state_root.length()
            + self.receipts_root.length()
            + self.features.length()
    }

    fn encode_unsigned(&self, out: &mut Vec<u8>) {
        alloy_rlp::Header {
            list: true,
            payload_length: self.unsigned_payload_length(),
        }
        .encode(out);
        self.encode_fields(out);
    }

    fn encode_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.parent_id.encode(out);
        self.timestamp.encode(out);
        self.gas_limit.encode(out);
        self.beneficiary.encode(out);
        self.gas_used.encode(out);
        self.total_score.encode(out);
        self.txs_root.encode(out);
        self.state_root.encode(out);
        self.receipts_root.encode(out);
        self.features.encode(out);
    }
}

impl Encodable for Header {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        alloy_rlp::Header {
            list: true,
            payload_length: self.unsigned_payload_length() + self.signature.length(),
        }
        .encode(out);
        self.encode_fields(out);
        self.signature.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.unsigned_payload_length() + self.signature.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Header {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = alloy_rlp::Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let mut payload = &buf[..header.payload_length];
        buf.advance(header.payload_length);

        let decoded = Self {
            parent_id: BlockId::decode(&mut payload)?,
            timestamp: u64::decode(&mut payload)?,
            gas_limit: u64::decode(&mut payload)?,
            beneficiary: Address::decode(&mut payload)?,
            gas_used: u64::decode(&mut payload)?,
            total_score: u64::decode(&mut payload)?,
            txs_root: B256::decode(&mut payload)?,
            state_root: B256::decode(&mut payload)?,
            receipts_root: B256::decode(&mut payload)?,
            features: Features::decode(&mut payload)?,
            signature: Bytes::decode(&mut payload)?,
        };
        if !payload.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(decoded)
    }
}
