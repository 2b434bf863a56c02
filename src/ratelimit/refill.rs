use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use super::token_bucket::Shared;
use crate::metrics::BucketMetrics;

/// Background task that refills a bucket and hands tokens to waiters
pub(crate) struct RefillTask {
    shared: Arc<Shared>,
    interval: Duration,
    start: Instant,
    shutdown: broadcast::Receiver<()>,
}

impl RefillTask {
    pub fn new(
        shared: Arc<Shared>,
        interval: Duration,
        start: Instant,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            shared,
            interval,
            start,
            shutdown,
        }
    }

    /// Run until destroyed or until the bucket is dropped
    pub async fn run(mut self) {
        let mut refill_timer = tokio::time::interval_at(self.start, self.interval);
        // A late tick adds a single token; missed ticks are not made up.
        refill_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(
            bucket = %self.shared.name,
            interval_ms = self.interval.as_millis() as u64,
            "Refill task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    break;
                }
                _ = refill_timer.tick() => {
                    self.tick();
                }
            }
        }

        tracing::debug!(bucket = %self.shared.name, "Refill task stopped");
    }

    fn tick(&self) {
        let (outcome, available, waiting, queued) = {
            let mut state = self.shared.lock();
            let outcome = state.refill(self.shared.capacity);
            (
                outcome,
                state.available,
                state.queue.live_len(),
                state.queue.len(),
            )
        };

        BucketMetrics::set_available(&self.shared.name, available);
        BucketMetrics::set_waiting(&self.shared.name, waiting);

        if outcome.served > 0 || outcome.discarded > 0 {
            tracing::debug!(
                bucket = %self.shared.name,
                served = outcome.served,
                discarded = outcome.discarded,
                available = available,
                waiting = waiting,
                "Served waiting requests"
            );
        } else {
            tracing::trace!(
                bucket = %self.shared.name,
                refilled = outcome.refilled,
                available = available,
                queued = queued,
                "Refill tick"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TokenBucket;

    #[tokio::test(start_paused = true)]
    async fn test_refill_adds_one_token_per_tick() {
        let bucket = TokenBucket::new(Duration::from_secs(1), 5);
        assert!(bucket.try_acquire(5));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(bucket.available(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bucket.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(Duration::from_secs(1), 2);
        assert!(bucket.try_acquire(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_task_stops_on_destroy() {
        let bucket = TokenBucket::new(Duration::from_secs(1), 3);
        assert!(bucket.try_acquire(3));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(bucket.available(), 1);

        bucket.destroy();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bucket.available(), 1);
    }
}
