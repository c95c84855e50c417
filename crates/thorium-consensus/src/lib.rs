//! Peer-block consensus: validation against the parent state, retry
//! buffers for early and orphaned blocks, and the atomic commit path both
//! the consensus and packer loops share.

pub mod commit;
pub mod consensus_loop;
pub mod future_heap;
pub mod orphan_map;
pub mod validator;

pub use commit::{CommitOutcome, Committer};
pub use consensus_loop::ConsensusLoop;
pub use future_heap::FutureHeap;
pub use orphan_map::OrphanMap;
pub use validator::{Consensus, ValidationError};
