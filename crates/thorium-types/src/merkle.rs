//! Binary merkle root over ordered byte lists, used for the transactions
//! and receipts roots.

use crate::crypto::blake2b256;
use alloy_primitives::B256;

/// Root of the list; an empty list hashes to Blake2b-256 of the empty string.
pub fn merkle_root<I>(items: I) -> B256
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut layer: Vec<B256> = items
        .into_iter()
        .map(|item| blake2b256(&[item.as_ref()]))
        .collect();
    if layer.is_empty() {
        return blake2b256(&[b""]);
    }
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => blake2b256(&[left.as_slice(), right.as_slice()]),
                [odd] => *odd,
                _ => unreachable!(),
            })
            .collect();
    }
    layer[0]
}
