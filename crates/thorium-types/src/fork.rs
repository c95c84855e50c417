use serde::{Deserialize, Serialize};

/// Block numbers at which protocol upgrades activate. A rule guarded by a
/// fork applies to blocks whose number is at or above the configured height.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkConfig {
    pub vip191: u32,
    pub vip193: u32,
    pub vip214: u32,
    pub galactica: u32,
    pub hayabusa: u32,
    pub blocklist: u32,
}

impl ForkConfig {
    /// Every upgrade active from genesis; the dev-network preset.
    pub fn all_at_genesis() -> Self {
        Self {
            vip191: 0,
            vip193: 0,
            vip214: 0,
            galactica: 0,
            hayabusa: 0,
            blocklist: 0,
        }
    }

    /// No upgrade ever activates; the original rule set throughout.
    pub fn never() -> Self {
        Self {
            vip191: u32::MAX,
            vip193: u32::MAX,
            vip214: u32::MAX,
            galactica: u32::MAX,
            hayabusa: u32::MAX,
            blocklist: u32::MAX,
        }
    }
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self::all_at_genesis()
    }
}
