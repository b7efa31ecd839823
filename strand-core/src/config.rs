//! Store configuration

use serde::{Deserialize, Serialize};

/// Tunables for a [`Store`](crate::store::Store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Persist a snapshot to the configured sink every N changed commits;
    /// `None` disables the cadence entirely
    pub snapshot_every: Option<u64>,

    /// Maximum retained subscription faults; older entries are dropped
    pub fault_log_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_every: None,
            fault_log_capacity: 256,
        }
    }
}
