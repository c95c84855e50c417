use crate::header::Header;
use crate::ids::BlockId;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;
use alloy_primitives::B256;
use alloy_rlp::{Decodable, Encodable};
use bytes::Buf;

/// A header plus its ordered transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    header: Header,
    txs: Vec<Transaction>,
}

impl Block {
    pub fn new(header: Header, txs: Vec<Transaction>) -> Self {
        Self { header, txs }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.txs
    }

    pub fn into_parts(self) -> (Header, Vec<Transaction>) {
        (self.header, self.txs)
    }

    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn number(&self) -> u32 {
        self.header.number()
    }

    /// Root the header's `txs_root` must equal.
    pub fn compute_txs_root(&self) -> B256 {
        txs_root(&self.txs)
    }
}

/// Merkle root over the RLP encoding of each transaction.
pub fn txs_root(txs: &[Transaction]) -> B256 {
    merkle_root(txs.iter().map(alloy_rlp::encode))
}

impl Encodable for Block {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.header.length() + self.txs.length();
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.header.encode(out);
        self.txs.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.header.length() + self.txs.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let outer = alloy_rlp::Header::decode(buf)?;
        if !outer.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let mut payload = &buf[..outer.payload_length];
        buf.advance(outer.payload_length);

        let header = Header::decode(&mut payload)?;
        let txs = Vec::<Transaction>::decode(&mut payload)?;
        if !payload.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(Self { header, txs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Features;
    use crate::transaction::{Clause, Pricing};
    use alloy_primitives::{Address, Bytes, U256};
    use secp256k1::SecretKey;

    fn sample_block() -> Block {
        let key = SecretKey::new(&mut rand::thread_rng());
        let tx = Transaction {
            chain_tag: 9,
            block_ref: [0; 8],
            expiration: 100,
            clauses: vec![Clause::transfer(Address::repeat_byte(1), U256::from(5u8))],
            pricing: Pricing::Legacy { gas_price_coef: 0 },
            gas: 21_000,
            depends_on: None,
            nonce: 1,
            features: Features::default(),
            signature: Bytes::new(),
        }
        .sign(&key);
        let header = Header {
            parent_id: BlockId::new(u32::MAX, B256::ZERO),
            timestamp: 10,
            gas_limit: 10_000_000,
            beneficiary: Address::ZERO,
            gas_used: 21_000,
            total_score: 1,
            txs_root: txs_root(std::slice::from_ref(&tx)),
            state_root: B256::repeat_byte(2),
            receipts_root: B256::repeat_byte(3),
            features: Features::default(),
            signature: Bytes::new(),
        }
        .sign(&key);
        Block::new(header, vec![tx])
    }

    #[test]
    fn round_trip() {
        let block = sample_block();
        let encoded = alloy_rlp::encode(&block);
        assert_eq!(encoded.len(), block.length());
        assert_eq!(Block::decode(&mut encoded.as_slice()).unwrap(), block);
    }

    #[test]
    fn txs_root_matches_header() {
        let block = sample_block();
        assert_eq!(block.compute_txs_root(), block.header().txs_root);
    }
}
