//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{ACQUIRED_TOTAL, AVAILABLE_TOKENS, REJECTED_TOTAL, TIMEOUTS_TOTAL, WAITING_REQUESTS};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording token bucket metrics
pub struct BucketMetrics;

impl BucketMetrics {
    /// Record tokens taken without queueing
    pub fn record_immediate(bucket: &str) {
        ACQUIRED_TOTAL.with_label_values(&[bucket, "immediate"]).inc();
    }

    /// Record a queued request served by the refill task
    pub fn record_queued(bucket: &str) {
        ACQUIRED_TOTAL.with_label_values(&[bucket, "queued"]).inc();
    }

    /// Record a non-blocking attempt that found too few tokens
    pub fn record_rejected(bucket: &str) {
        REJECTED_TOTAL.with_label_values(&[bucket]).inc();
    }

    /// Record a request abandoned at its deadline
    pub fn record_timeout(bucket: &str) {
        TIMEOUTS_TOTAL.with_label_values(&[bucket]).inc();
    }

    pub fn set_available(bucket: &str, available: u64) {
        AVAILABLE_TOKENS
            .with_label_values(&[bucket])
            .set(i64::try_from(available).unwrap_or(i64::MAX));
    }

    pub fn set_waiting(bucket: &str, waiting: usize) {
        WAITING_REQUESTS
            .with_label_values(&[bucket])
            .set(i64::try_from(waiting).unwrap_or(i64::MAX));
    }
}
