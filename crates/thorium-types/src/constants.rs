//! Protocol constants shared across the core.

use alloy_primitives::U256;

/// Seconds between consecutive block slots on the production network.
pub const BLOCK_INTERVAL: u64 = 10;

/// Smallest gas limit a block may carry.
pub const MIN_GAS_LIMIT: u64 = 5_000;

/// Gas limit of the genesis block on dev networks.
pub const INITIAL_GAS_LIMIT: u64 = 10_000_000;

/// Per-block gas limit drift is bounded by `parent_gas_limit / this`.
pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

/// Cap applied to adaptive gas-limit suggestions.
pub const GAS_LIMIT_SOFT_LIMIT: u64 = 21_000_000;

/// Base cost of any transaction.
pub const TX_GAS: u64 = 5_000;

/// Cost of a clause calling an existing account.
pub const CLAUSE_GAS: u64 = 16_000;

/// Cost of a clause creating a contract.
pub const CLAUSE_GAS_CONTRACT_CREATION: u64 = 48_000;

/// Per-byte cost of zero bytes in clause data.
pub const TX_DATA_ZERO_GAS: u64 = 4;

/// Per-byte cost of non-zero bytes in clause data.
pub const TX_DATA_NON_ZERO_GAS: u64 = 68;

/// A peer block whose timestamp exceeds local time by more than this many
/// seconds is held back as a future block.
pub const FUTURE_TIMESTAMP_TOLERANCE: u64 = 10;

/// How long an orphan waits for its parent before being swept, in seconds.
pub const ORPHAN_TTL: u64 = 300;

/// Default bound on the state-history window kept by the pruner.
pub const MAX_STATE_HISTORY: u64 = 65_535;

/// Default cap on the authority candidate set.
pub const MAX_BLOCK_PROPOSERS: u64 = 101;

/// Default gas price used when the params registry carries no override.
pub const INITIAL_BASE_GAS_PRICE: U256 = U256::from_limbs([10_000_000_000_000, 0, 0, 0]);
