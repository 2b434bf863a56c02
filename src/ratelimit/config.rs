//! Token bucket configuration

use std::time::Duration;

use serde::Deserialize;

/// Configuration for a single token bucket
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Name used in log fields and metric labels
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum number of tokens the bucket holds
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Milliseconds between single-token refills
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_interval_ms() -> u64 {
    1000 // One token per second
}

impl BucketConfig {
    /// Refill interval as a `Duration`
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            capacity: default_capacity(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}
