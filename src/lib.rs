// Infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Rate limiting
pub mod ratelimit;

pub use error::{BucketError, Result};
pub use ratelimit::{BucketConfig, BucketStats, TokenBucket};
