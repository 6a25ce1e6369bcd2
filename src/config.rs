use std::time::Duration;
use serde::{Deserialize, Serialize};




/**
 * Tunables for the transfer runtime. The defaults are fine for in-process
 * ranks; runs over a real network will want a longer stall timeout.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {

    /// How long one completion poll may block waiting for an inbound
    /// message, in milliseconds.
    pub poll_interval_ms: u64,

    /// How long the graph iterator waits without any transfer completing
    /// before it declares the invocation stalled, in milliseconds.
    pub stall_timeout_ms: u64,

    /// Compute the staging buffers of one region's outbound edges on the
    /// Rayon thread pool.
    pub parallel_staging: bool,
}




// ============================================================================
impl RuntimeConfig {

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2,
            stall_timeout_ms: 30_000,
            parallel_staging: true,
        }
    }
}
