//! Prometheus metrics for token buckets.
//!
//! Every collector is labelled with the bucket name, so independent buckets
//! report separately:
//! - Acquisitions by path (served immediately or after queueing)
//! - Rejected non-blocking attempts
//! - Deadlines that expired while queued
//! - Available tokens and waiting requests

mod helpers;

pub use helpers::{encode_metrics, BucketMetrics};

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "token_bucket";

lazy_static! {
    /// Tokens acquired, by bucket and by path ("immediate" or "queued")
    pub static ref ACQUIRED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_acquired_total", METRIC_PREFIX),
        "Total successful acquisitions",
        &["bucket", "path"]
    ).unwrap();

    /// Non-blocking acquisitions that found too few tokens
    pub static ref REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_rejected_total", METRIC_PREFIX),
        "Total non-blocking acquisitions rejected for lack of tokens",
        &["bucket"]
    ).unwrap();

    /// Queued requests abandoned at their deadline
    pub static ref TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_timeouts_total", METRIC_PREFIX),
        "Total queued requests abandoned after their deadline",
        &["bucket"]
    ).unwrap();

    pub static ref AVAILABLE_TOKENS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_available_tokens", METRIC_PREFIX),
        "Tokens available after the last refill tick",
        &["bucket"]
    ).unwrap();

    pub static ref WAITING_REQUESTS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_waiting_requests", METRIC_PREFIX),
        "Requests parked in the wait queue after the last refill tick",
        &["bucket"]
    ).unwrap();
}
