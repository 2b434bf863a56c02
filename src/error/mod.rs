use thiserror::Error;

/// Errors raised while building or using a token bucket.
///
/// Contract violations on a live bucket (a count above capacity) are not
/// returned: the bucket panics with the `Display` of the matching variant.
#[derive(Error, Debug)]
pub enum BucketError {
    #[error("token bucket: refill interval must be greater than zero")]
    ZeroInterval,

    #[error("token bucket: refill interval {0:?} is too long to schedule")]
    IntervalTooLong(std::time::Duration),

    #[error("token bucket: count {count} exceeds capacity {capacity}")]
    CountExceedsCapacity { count: u64, capacity: u64 },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, BucketError>;
