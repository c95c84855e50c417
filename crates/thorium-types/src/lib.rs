//! Primitive chain types: identifiers, headers, blocks, transactions,
//! receipts and the signing/recovery helpers they share.

pub mod block;
pub mod constants;
pub mod crypto;
pub mod features;
pub mod fork;
pub mod header;
pub mod ids;
pub mod merkle;
pub mod receipt;
pub mod transaction;

pub use alloy_primitives::{Address, Bytes, B256, U256};
pub use block::Block;
pub use features::Features;
pub use fork::ForkConfig;
pub use header::Header;
pub use ids::{BlockId, TxId};
pub use receipt::{Event, Output, Receipt, Transfer};
pub use transaction::{Clause, Pricing, Transaction};
