//! Dataplane Configuration

use crate::{VnetError, VnetResult, MAX_VECTOR_LEN};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dataplane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// Check per-batch invariants (output length, ring indices) and fail hard
    pub invariant_checks: bool,
    /// Emit error and transmit events on the `vnet::elog` trace target
    pub event_log: bool,
    /// Per-thread error shards allocated up front
    pub error_threads: usize,
    /// Batches from thread ids at or above this are rejected as stale
    pub max_threads: usize,
    /// Maximum references per outbound transmit batch
    pub tx_vector_len: usize,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            invariant_checks: cfg!(debug_assertions),
            event_log: false,
            error_threads: 1,
            max_threads: 64,
            tx_vector_len: MAX_VECTOR_LEN,
        }
    }
}

impl DataplaneConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> VnetResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse from a JSON string
    pub fn from_json(s: &str) -> VnetResult<Self> {
        let config: Self = serde_json::from_str(s).map_err(|e| VnetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> VnetResult<()> {
        if self.tx_vector_len == 0 || self.tx_vector_len > MAX_VECTOR_LEN {
            return Err(VnetError::Config(format!(
                "tx_vector_len must be in 1..={}, got {}",
                MAX_VECTOR_LEN, self.tx_vector_len
            )));
        }
        if self.max_threads == 0 || self.error_threads > self.max_threads {
            return Err(VnetError::Config(format!(
                "max_threads must be at least 1 and error_threads ({}), got {}",
                self.error_threads, self.max_threads
            )));
        }
        Ok(())
    }
}
