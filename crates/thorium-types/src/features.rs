use alloy_rlp::{Decodable, Encodable};
use serde::{Deserialize, Serialize};

/// Transaction-features bitset carried by transactions and aggregated into
/// the block header.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Features(pub u32);

impl Features {
    const DELEGATED: u32 = 1;

    pub fn is_delegated(&self) -> bool {
        self.0 & Self::DELEGATED != 0
    }

    pub fn set_delegated(&mut self, on: bool) {
        if on {
            self.0 |= Self::DELEGATED;
        } else {
            self.0 &= !Self::DELEGATED;
        }
    }

    /// Bits outside the understood set; such a value is structurally invalid.
    pub fn has_unknown_bits(&self) -> bool {
        self.0 & !Self::DELEGATED != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }
}

impl Encodable for Features {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for Features {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Self(u32::decode(buf)?))
    }
}
