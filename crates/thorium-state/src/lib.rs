//! World state: a hash-linked trie over spaced node storage, checkpointed
//! mutation, staged commits, builtin registries and the transaction runtime.

pub mod builtins;
pub mod genesis;
pub mod index;
pub mod runtime;
pub mod state;
pub mod store;
pub mod trie;

pub use genesis::GenesisBuilder;
pub use runtime::{BlockContext, ExecutionError, Runtime};
pub use state::{Account, Stage, State, Stater};
pub use store::{NodeStore, SpacedNodeStore};
pub use trie::{Trie, EMPTY_ROOT};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("kv: {0}")]
    Kv(#[from] thorium_storage::KvError),
    #[error("missing trie node {0}")]
    MissingNode(thorium_types::B256),
    #[error("corrupt state data: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StateError>;
