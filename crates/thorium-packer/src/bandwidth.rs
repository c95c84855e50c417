//! Gas-per-second throughput estimation across recently packed blocks,
//! feeding adaptive gas-limit suggestions.

use std::sync::Mutex;
use std::time::Duration;
use thorium_types::constants::{BLOCK_INTERVAL, MIN_GAS_LIMIT};
use thorium_types::Header;

/// Exponential weight: 15 parts history, 1 part observation.
const SMOOTHING_SHIFT: u128 = 4;

#[derive(Default)]
pub struct Bandwidth {
    gas_per_second: Mutex<u64>,
}

impl Bandwidth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u64 {
        *self.gas_per_second.lock().expect("bandwidth lock")
    }

    /// Folds one packed block into the estimate. Blocks that were mostly
    /// empty carry no throughput signal and are skipped.
    pub fn update(&self, header: &Header, elapsed: Duration) -> (u64, bool) {
        let mut gps = self.gas_per_second.lock().expect("bandwidth lock");
        if elapsed.is_zero() || header.gas_used < header.gas_limit / 10 * 9 {
            return (*gps, false);
        }
        let observed =
            (u128::from(header.gas_used) * 1_000 / elapsed.as_millis().max(1)) as u64;
        *gps = if *gps == 0 {
            observed
        } else {
            let weighted = (u128::from(*gps) << SMOOTHING_SHIFT) - u128::from(*gps)
                + u128::from(observed);
            (weighted >> SMOOTHING_SHIFT) as u64
        };
        (*gps, true)
    }

    /// Gas limit filling half a block interval at the estimated rate;
    /// callers cap it when running adaptive.
    pub fn suggest_gas_limit(&self) -> u64 {
        let gps = self.value();
        (gps.saturating_mul(BLOCK_INTERVAL) / 2).max(MIN_GAS_LIMIT)
    }
}
