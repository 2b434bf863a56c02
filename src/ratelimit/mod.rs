//! Token bucket rate limiting.
//!
//! A [`TokenBucket`] holds up to `capacity` tokens and gains one token per
//! refill interval. Callers take tokens immediately ([`TokenBucket::try_acquire`]),
//! wait for them ([`TokenBucket::acquire`]), or wait with a deadline
//! ([`TokenBucket::acquire_timeout`]). Waiting callers are served strictly in
//! arrival order by a background refill task.

mod config;
mod refill;
mod token_bucket;
mod waiter;

pub use config::BucketConfig;
pub use token_bucket::{BucketStats, TokenBucket};
