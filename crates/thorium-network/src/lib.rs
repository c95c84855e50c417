//! The message contract toward the peer layer, an in-process realization
//! of it, and the transaction-sync loops bridging peers and the pool.

pub mod peer;
pub mod sync;

pub use peer::{InProcNet, PeerBlockEvent, PeerNet};
pub use sync::TxSync;
