//! Blake2b-256 hashing and recoverable secp256k1 signatures.

use alloy_primitives::{keccak256, Address, B256};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

/// Length of a recoverable signature: r ‖ s ‖ v.
pub const SIGNATURE_LEN: usize = 65;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid signature length {0}")]
    InvalidSignatureLength(usize),
    #[error("signature recovery failed")]
    Recovery,
}

/// Blake2b-256 over the concatenation of `parts`.
pub fn blake2b256(parts: &[&[u8]]) -> B256 {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    B256::from_slice(&hasher.finalize())
}

/// Signs `hash` producing a 65-byte recoverable signature.
pub fn sign_hash(hash: &B256, key: &SecretKey) -> [u8; SIGNATURE_LEN] {
    let msg = Message::from_digest(hash.0);
    let (rec_id, compact) = SECP256K1
        .sign_ecdsa_recoverable(&msg, key)
        .serialize_compact();
    let mut sig = [0u8; SIGNATURE_LEN];
    sig[..64].copy_from_slice(&compact);
    sig[64] = rec_id.to_i32() as u8;
    sig
}

/// Recovers the signing address from a 65-byte recoverable signature.
pub fn recover_signer(hash: &B256, sig: &[u8]) -> Result<Address, CryptoError> {
    if sig.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignatureLength(sig.len()));
    }
    let rec_id =
        RecoveryId::from_i32(i32::from(sig[64])).map_err(|_| CryptoError::Recovery)?;
    let signature = RecoverableSignature::from_compact(&sig[..64], rec_id)
        .map_err(|_| CryptoError::Recovery)?;
    let msg = Message::from_digest(hash.0);
    let public = SECP256K1
        .recover_ecdsa(&msg, &signature)
        .map_err(|_| CryptoError::Recovery)?;
    Ok(public_key_to_address(&public))
}

/// Derives the address of `key`'s public counterpart.
pub fn address_of(key: &SecretKey) -> Address {
    public_key_to_address(&key.public_key(SECP256K1))
}

fn public_key_to_address(public: &PublicKey) -> Address {
    let uncompressed = public.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    Address::from_slice(&hash[12..])
}
