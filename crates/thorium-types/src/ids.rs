use alloy_primitives::B256;
use alloy_rlp::{Decodable, Encodable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte block identifier whose top 4 bytes carry the big-endian block
/// number, so the height is readable without fetching the header.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub B256);

impl BlockId {
    /// Splices `number` into the top 4 bytes of `hash`.
    pub fn new(number: u32, hash: B256) -> Self {
        let mut bytes = hash.0;
        bytes[..4].copy_from_slice(&number.to_be_bytes());
        Self(B256::new(bytes))
    }

    pub fn number(&self) -> u32 {
        u32::from_be_bytes(self.0[..4].try_into().expect("4-byte prefix"))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl Encodable for BlockId {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for BlockId {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Self(B256::decode(buf)?))
    }
}

/// A 32-byte transaction identifier.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub B256);

impl TxId {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

impl Encodable for TxId {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for TxId {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Self(B256::decode(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_round_trips_through_id() {
        let id = BlockId::new(0x0102_0304, B256::repeat_byte(0xaa));
        assert_eq!(id.number(), 0x0102_0304);
        assert_eq!(&id.0[4..], &[0xaa; 28]);
    }

    #[test]
    fn display_is_prefixed_hex() {
        let id = BlockId::new(1, B256::ZERO);
        assert!(id.to_string().starts_with("0x00000001"));
    }
}
