//! Builtin registries living at reserved addresses inside the state:
//! chain params, the authority (proposer) table and the block-list.

use crate::state::State;
use crate::{Result, StateError};
use serde::{Deserialize, Serialize};
use thorium_types::{Address, B256, U256};

/// Reserved builtin addresses carry their ascii name, right-aligned.
fn builtin_address(name: &[u8]) -> Address {
    debug_assert!(name.len() <= 20);
    let mut bytes = [0u8; 20];
    bytes[20 - name.len()..].copy_from_slice(name);
    Address::new(bytes)
}

pub fn params_address() -> Address {
    builtin_address(b"Params")
}

pub fn authority_address() -> Address {
    builtin_address(b"Authority")
}

pub fn blocklist_address() -> Address {
    builtin_address(b"Blocklist")
}

/// Well-known params keys.
pub const KEY_ENDORSEMENT: &[u8] = b"endorsement";
pub const KEY_MAX_BLOCK_PROPOSERS: &[u8] = b"max-block-proposers";
pub const KEY_BASE_GAS_PRICE: &[u8] = b"base-gas-price";

/// Numeric registry under [`params_address`].
pub struct Params;

impl Params {
    pub fn get(state: &State, key: &[u8]) -> Result<Option<U256>> {
        let raw = state.get_storage(params_address(), key)?;
        if raw.is_empty() {
            return Ok(None);
        }
        if raw.len() > 32 {
            return Err(StateError::Corrupt(format!(
                "params value of {} bytes",
                raw.len()
            )));
        }
        Ok(Some(U256::from_be_slice(&raw)))
    }

    pub fn get_or(state: &State, key: &[u8], default: U256) -> Result<U256> {
        Ok(Self::get(state, key)?.unwrap_or(default))
    }

    pub fn set(state: &mut State, key: &[u8], value: U256) {
        let bytes = value.to_be_bytes::<32>();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(31);
        state.set_storage(params_address(), key, bytes[first..].to_vec());
    }
}

/// One proposer row in the authority registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityRow {
    pub signer: Address,
    /// The account whose balance backs the signer's eligibility.
    pub endorsor: Address,
    pub identity: B256,
    pub active: bool,
}

const AUTHORITY_ROWS_KEY: &[u8] = b"rows";

/// The on-state proposer table, ordered as registered.
pub struct Authority;

impl Authority {
    pub fn rows(state: &State) -> Result<Vec<AuthorityRow>> {
        let raw = state.get_storage(authority_address(), AUTHORITY_ROWS_KEY)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        bcs::from_bytes(&raw).map_err(|e| StateError::Corrupt(e.to_string()))
    }

    pub fn set_rows(state: &mut State, rows: &[AuthorityRow]) -> Result<()> {
        let encoded = bcs::to_bytes(rows).map_err(|e| StateError::Corrupt(e.to_string()))?;
        state.set_storage(authority_address(), AUTHORITY_ROWS_KEY, encoded);
        Ok(())
    }

    pub fn add(state: &mut State, row: AuthorityRow) -> Result<()> {
        let mut rows = Self::rows(state)?;
        rows.push(row);
        Self::set_rows(state, &rows)
    }

    /// Flips one signer's active flag; false when the signer is unknown.
    pub fn update_active(state: &mut State, signer: Address, active: bool) -> Result<bool> {
        let mut rows = Self::rows(state)?;
        let Some(row) = rows.iter_mut().find(|row| row.signer == signer) else {
            return Ok(false);
        };
        if row.active != active {
            row.active = active;
            Self::set_rows(state, &rows)?;
        }
        Ok(true)
    }
}

/// Addresses barred from originating transactions past the block-list fork.
pub struct Blocklist;

impl Blocklist {
    pub fn contains(state: &State, address: Address) -> Result<bool> {
        Ok(!state
            .get_storage(blocklist_address(), address.as_slice())?
            .is_empty())
    }

    pub fn set(state: &mut State, address: Address, barred: bool) {
        let value = if barred { vec![1] } else { Vec::new() };
        state.set_storage(blocklist_address(), address.as_slice(), value);
    }
}
