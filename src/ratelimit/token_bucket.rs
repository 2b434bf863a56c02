//! Token Bucket algorithm implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::config::BucketConfig;
use super::refill::RefillTask;
use super::waiter::WaitQueue;
use crate::error::{BucketError, Result};
use crate::metrics::BucketMetrics;

const DEFAULT_BUCKET_NAME: &str = "default";

/// Token counter and wait queue, guarded together by one lock.
#[derive(Debug)]
pub(crate) struct BucketState {
    pub available: u64,
    pub queue: WaitQueue,
}

/// What a single refill tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TickOutcome {
    pub refilled: bool,
    pub served: usize,
    pub discarded: usize,
}

impl BucketState {
    fn new(capacity: u64) -> Self {
        Self {
            available: capacity,
            queue: WaitQueue::new(),
        }
    }

    /// Adds one token (never above capacity) and serves waiters.
    pub fn refill(&mut self, capacity: u64) -> TickOutcome {
        let refilled = self.available < capacity;
        if refilled {
            self.available += 1;
        }

        let (served, discarded) = self.serve();
        TickOutcome {
            refilled,
            served,
            discarded,
        }
    }

    /// Hands tokens to waiters in arrival order, stopping at the first live request
    /// that cannot be satisfied. Returns `(served, discarded)`.
    pub fn serve(&mut self) -> (usize, usize) {
        let mut served = 0;
        let mut discarded = 0;

        loop {
            let Some(head) = self.queue.front() else {
                break;
            };

            if head.is_abandoned() {
                self.queue.pop_front();
                discarded += 1;
                continue;
            }

            if head.need > self.available {
                break;
            }

            let Some(request) = self.queue.pop_front() else {
                break;
            };
            let consume = request.consume;
            self.available -= consume;

            if request.notify() {
                served += 1;
            } else {
                // Owner dropped its future after the abandonment check
                self.available += consume;
                discarded += 1;
            }
        }

        (served, discarded)
    }
}

/// State shared between the bucket handle and its refill task.
#[derive(Debug)]
pub(crate) struct Shared {
    pub name: String,
    pub capacity: u64,
    state: Mutex<BucketState>,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, BucketState> {
        // No critical section panics, so the state is consistent even if poisoned.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Token bucket that refills one token per interval and serves blocked callers
/// in strict arrival order.
///
/// The bucket starts full. A background tokio task adds a token every
/// `interval` and hands accumulated tokens to the head of the wait queue; a
/// queued request never gets overtaken by one queued after it, even if the
/// later one needs fewer tokens.
///
/// Requesting more tokens than the bucket can ever hold is a caller bug and
/// panics. Running out of tokens, or out of time in the `*_timeout`
/// variants, is reported as `false`.
///
/// Construction spawns the refill task, so it must happen inside a tokio
/// runtime. The task stops on [`TokenBucket::destroy`] or when the bucket is
/// dropped.
#[derive(Debug)]
pub struct TokenBucket {
    shared: Arc<Shared>,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    destroyed: AtomicBool,
}

impl TokenBucket {
    /// Create a full bucket that refills one token every `interval`.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero or too long to schedule, or when called
    /// outside a tokio runtime.
    pub fn new(interval: Duration, capacity: u64) -> Self {
        match Self::try_new(interval, capacity) {
            Ok(bucket) => bucket,
            Err(e) => panic!("{e}"),
        }
    }

    /// Like [`TokenBucket::new`], but reports an invalid interval as an error.
    /// Still panics outside a tokio runtime.
    pub fn try_new(interval: Duration, capacity: u64) -> Result<Self> {
        Self::build(DEFAULT_BUCKET_NAME.to_string(), interval, capacity)
    }

    /// Create a bucket from configuration.
    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        Self::build(config.name.clone(), config.refill_interval(), config.capacity)
    }

    fn build(name: String, interval: Duration, capacity: u64) -> Result<Self> {
        if interval.is_zero() {
            return Err(BucketError::ZeroInterval);
        }

        let first_refill = Instant::now()
            .checked_add(interval)
            .ok_or(BucketError::IntervalTooLong(interval))?;

        let shared = Arc::new(Shared {
            name,
            capacity,
            state: Mutex::new(BucketState::new(capacity)),
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = RefillTask::new(
            shared.clone(),
            interval,
            first_refill,
            shutdown_rx,
        );
        tokio::spawn(task.run());

        BucketMetrics::set_available(&shared.name, capacity);
        BucketMetrics::set_waiting(&shared.name, 0);

        tracing::debug!(
            bucket = %shared.name,
            capacity = capacity,
            interval_ms = interval.as_millis() as u64,
            "Token bucket created"
        );

        Ok(Self {
            shared,
            interval,
            shutdown_tx,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Name used in logs and metric labels
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Maximum number of tokens
    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Time between refills
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current number of tokens. May be stale as soon as it returns.
    pub fn available(&self) -> u64 {
        self.shared.lock().available
    }

    /// Number of callers currently parked in the wait queue
    pub fn waiting(&self) -> usize {
        self.shared.lock().queue.live_len()
    }

    /// Try to take `count` tokens without waiting.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the capacity.
    pub fn try_acquire(&self, count: u64) -> bool {
        self.check_count(count);

        let acquired = {
            let mut state = self.shared.lock();
            if count <= state.available {
                state.available -= count;
                true
            } else {
                false
            }
        };

        if acquired {
            BucketMetrics::record_immediate(&self.shared.name);
        } else {
            BucketMetrics::record_rejected(&self.shared.name);
        }
        acquired
    }

    /// Take `count` tokens, waiting as long as it takes.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the capacity.
    pub async fn acquire(&self, count: u64) {
        self.wait_and_take(count, count, None).await;
    }

    /// Take `count` tokens, waiting at most `max_wait`. Returns false, having
    /// consumed nothing, if the deadline passes first.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the capacity.
    pub async fn acquire_timeout(&self, count: u64, max_wait: Duration) -> bool {
        self.wait_and_take(count, count, Some(max_wait)).await
    }

    /// Wait until `count` tokens are available without consuming any.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the capacity.
    pub async fn wait_only(&self, count: u64) {
        self.wait_and_take(count, 0, None).await;
    }

    /// Wait at most `max_wait` for `count` tokens to be available, consuming none.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the capacity.
    pub async fn wait_only_timeout(&self, count: u64, max_wait: Duration) -> bool {
        self.wait_and_take(count, 0, Some(max_wait)).await
    }

    /// Stop the refill task. Callers already waiting without a deadline stay
    /// blocked. Calling this more than once has no further effect.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.shutdown_tx.send(());

        tracing::debug!(
            bucket = %self.shared.name,
            waiting = self.waiting(),
            "Token bucket destroyed"
        );
    }

    /// Whether [`TokenBucket::destroy`] has been called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Snapshot of the bucket state
    pub fn stats(&self) -> BucketStats {
        let (available, waiting) = {
            let state = self.shared.lock();
            (state.available, state.queue.live_len())
        };

        BucketStats {
            name: self.shared.name.clone(),
            capacity: self.shared.capacity,
            available,
            waiting,
            refill_interval_ms: self.interval.as_millis() as u64,
            destroyed: self.is_destroyed(),
        }
    }

    fn check_count(&self, count: u64) {
        let capacity = self.shared.capacity;
        if count > capacity {
            panic!("{}", BucketError::CountExceedsCapacity { count, capacity });
        }
    }

    /// Takes `consume` tokens once `need` are available. With no live waiter
    /// queued and enough tokens the call returns at once; otherwise the request
    /// joins the tail of the queue and the refill task serves it.
    async fn wait_and_take(&self, need: u64, consume: u64, max_wait: Option<Duration>) -> bool {
        self.check_count(need);

        let (id, mut rx) = {
            let mut state = self.shared.lock();
            if !state.queue.has_live() && need <= state.available {
                state.available -= consume;
                BucketMetrics::record_immediate(&self.shared.name);
                return true;
            }
            state.queue.push(need, consume)
        };

        tracing::trace!(
            bucket = %self.shared.name,
            need = need,
            consume = consume,
            "Request queued"
        );

        let mut queued = QueuedRequest {
            bucket: self,
            id,
            armed: true,
        };

        let Some(max_wait) = max_wait else {
            let received = rx.await;
            queued.armed = false;
            return match received {
                Ok(()) => {
                    BucketMetrics::record_queued(&self.shared.name);
                    true
                }
                Err(_) => {
                    tracing::warn!(
                        bucket = %self.shared.name,
                        need = need,
                        "Wait signal dropped before the request was served"
                    );
                    false
                }
            };
        };

        let received = tokio::time::timeout(max_wait, &mut rx).await;
        queued.armed = false;
        match received {
            Ok(Ok(())) => {
                BucketMetrics::record_queued(&self.shared.name);
                true
            }
            Ok(Err(_)) => false,
            Err(_) => self.abandon(id, need, max_wait),
        }
    }

    /// Resolves a deadline against a concurrent hand-off. Both happen under
    /// the state lock, so the request is either still queued (abandon it) or
    /// already served (keep the tokens). Returns whether it was served.
    fn abandon(&self, id: u64, need: u64, max_wait: Duration) -> bool {
        let abandoned = {
            let mut state = self.shared.lock();
            let abandoned = state.queue.abandon(id);
            if abandoned {
                // The next request may already be satisfiable.
                state.serve();
            }
            abandoned
        };

        if !abandoned {
            BucketMetrics::record_queued(&self.shared.name);
            return true;
        }

        BucketMetrics::record_timeout(&self.shared.name);
        tracing::debug!(
            bucket = %self.shared.name,
            need = need,
            max_wait_ms = max_wait.as_millis() as u64,
            "Request abandoned after deadline"
        );
        false
    }
}

/// Abandons a queued request when its waiting future is dropped before the
/// request resolves, so the queue never keeps a dead entry counted as live.
struct QueuedRequest<'a> {
    bucket: &'a TokenBucket,
    id: u64,
    armed: bool,
}

impl Drop for QueuedRequest<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut state = self.bucket.shared.lock();
        if state.queue.abandon(self.id) {
            state.serve();
        }
    }
}

/// Statistics about a token bucket
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub name: String,
    pub capacity: u64,
    pub available: u64,
    pub waiting: usize,
    pub refill_interval_ms: u64,
    pub destroyed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    fn state_with(available: u64) -> BucketState {
        BucketState {
            available,
            queue: WaitQueue::new(),
        }
    }

    #[test]
    fn test_refill_saturates_at_capacity() {
        let mut state = state_with(2);

        let outcome = state.refill(2);
        assert!(!outcome.refilled);
        assert_eq!(state.available, 2);

        state.available = 1;
        assert!(state.refill(2).refilled);
        assert_eq!(state.available, 2);
    }

    #[test]
    fn test_serve_keeps_fifo_order() {
        let mut state = state_with(0);
        let (_first, mut rx1) = state.queue.push(3, 3);
        let (_second, mut rx2) = state.queue.push(1, 1);

        // One token is enough for the second request, but the head needs three.
        let outcome = state.refill(5);
        assert_eq!(outcome.served, 0);
        assert_eq!(state.available, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        state.refill(5);
        let outcome = state.refill(5);
        assert_eq!(outcome.served, 1);
        assert_eq!(state.available, 0);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        let outcome = state.refill(5);
        assert_eq!(outcome.served, 1);
        assert_eq!(state.available, 0);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_serve_skips_abandoned_head() {
        let mut state = state_with(0);
        let (first, _rx1) = state.queue.push(2, 2);
        let (_second, mut rx2) = state.queue.push(1, 1);

        assert!(state.queue.abandon(first));
        let outcome = state.refill(5);

        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.served, 1);
        assert_eq!(state.available, 0);
        assert!(rx2.try_recv().is_ok());
        assert_eq!(state.queue.len(), 0);
    }

    #[test]
    fn test_serve_does_not_consume_for_dropped_owner() {
        let mut state = state_with(0);
        let (_id, rx) = state.queue.push(1, 1);
        drop(rx);

        let outcome = state.refill(1);
        assert_eq!(outcome.served, 0);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(state.available, 1);
    }

    #[test]
    fn test_serve_wait_only_consumes_nothing() {
        let mut state = state_with(2);
        let (_a, mut rx_a) = state.queue.push(2, 0);
        let (_b, mut rx_b) = state.queue.push(1, 0);

        let (served, _) = state.serve();
        assert_eq!(served, 2);
        assert_eq!(state.available, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_new_bucket_is_full() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 100);
        assert_eq!(bucket.capacity(), 100);
        assert_eq!(bucket.available(), 100);
        assert_eq!(bucket.waiting(), 0);
        assert_eq!(bucket.name(), "default");
        bucket.destroy();
    }

    #[tokio::test]
    async fn test_zero_capacity_bucket() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 0);
        assert_eq!(bucket.capacity(), 0);
        assert_eq!(bucket.available(), 0);
        assert!(bucket.try_acquire(0));
    }

    #[tokio::test]
    #[should_panic(expected = "refill interval must be greater than zero")]
    async fn test_zero_interval_panics() {
        let _ = TokenBucket::new(Duration::ZERO, 1);
    }

    #[tokio::test]
    async fn test_try_new_rejects_zero_interval() {
        let result = TokenBucket::try_new(Duration::ZERO, 1);
        assert!(matches!(result, Err(BucketError::ZeroInterval)));
    }

    #[tokio::test]
    async fn test_try_new_rejects_unschedulable_interval() {
        let result = TokenBucket::try_new(Duration::MAX, 1);
        assert!(matches!(
            result,
            Err(BucketError::IntervalTooLong(d)) if d == Duration::MAX
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "too long to schedule")]
    async fn test_unschedulable_interval_panics() {
        let _ = TokenBucket::new(Duration::MAX, 1);
    }

    #[tokio::test]
    async fn test_very_long_interval_is_accepted() {
        let config = BucketConfig {
            name: "long-interval".to_string(),
            capacity: 1,
            refill_interval_ms: u64::MAX,
        };
        let bucket = TokenBucket::from_config(&config).unwrap();
        assert_eq!(bucket.available(), 1);
        assert!(bucket.try_acquire(1));
    }

    #[tokio::test]
    async fn test_deadline_after_hand_off_keeps_tokens() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 2);

        let (id, mut rx) = bucket.shared.lock().queue.push(1, 1);
        {
            let mut state = bucket.shared.lock();
            assert_eq!(state.serve(), (1, 0));
        }

        // Served before the deadline was processed: the caller keeps the token.
        assert!(bucket.abandon(id, 1, Duration::from_secs(1)));
        assert_eq!(bucket.available(), 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(bucket.waiting(), 0);
    }

    #[tokio::test]
    async fn test_deadline_before_hand_off_consumes_nothing() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 1);
        assert!(bucket.try_acquire(1));

        let (id, mut rx) = bucket.shared.lock().queue.push(1, 1);
        assert_eq!(bucket.waiting(), 1);

        assert!(!bucket.abandon(id, 1, Duration::from_secs(1)));
        assert_eq!(bucket.available(), 0);
        assert_eq!(bucket.waiting(), 0);
        // The wake signal is dropped, never sent
        assert!(rx.try_recv().is_err());

        // A later refill is not handed to the abandoned request
        let outcome = bucket.shared.lock().refill(1);
        assert_eq!(outcome.served, 0);
        assert_eq!(bucket.available(), 1);
    }

    #[tokio::test]
    async fn test_dropped_wait_leaves_queue() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 1);
        assert!(bucket.try_acquire(1));

        let mut fut = tokio_test::task::spawn(bucket.acquire(1));
        assert_pending!(fut.poll());
        assert_eq!(bucket.waiting(), 1);

        drop(fut);
        assert_eq!(bucket.waiting(), 0);
        assert_eq!(bucket.shared.lock().queue.len(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "count 2 exceeds capacity 1")]
    async fn test_try_acquire_above_capacity_panics() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 1);
        bucket.try_acquire(2);
    }

    #[tokio::test]
    #[should_panic(expected = "count 6 exceeds capacity 5")]
    async fn test_acquire_above_capacity_panics() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 5);
        bucket.acquire(6).await;
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let bucket = TokenBucket::new(Duration::from_secs(60), 5);

        assert!(bucket.try_acquire(1));
        assert_eq!(bucket.available(), 4);

        assert!(bucket.try_acquire(4));
        assert!(!bucket.try_acquire(1));
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(Duration::from_secs(2), 1);
        assert!(bucket.try_acquire(1));

        let mut fut = tokio_test::task::spawn(bucket.acquire(1));
        assert_pending!(fut.poll());
        assert_eq!(bucket.waiting(), 1);

        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert!(fut.is_woken());
        assert_ready!(fut.poll());
        assert_eq!(bucket.available(), 0);
        assert_eq!(bucket.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_tokens_untouched() {
        let bucket = TokenBucket::new(Duration::from_secs(10), 1);
        assert!(bucket.try_acquire(1));

        let start = Instant::now();
        assert!(!bucket.acquire_timeout(1, Duration::from_secs(2)).await);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(bucket.available(), 0);
        assert_eq!(bucket.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_refill() {
        let bucket = TokenBucket::new(Duration::from_secs(1), 2);
        assert!(bucket.try_acquire(2));

        bucket.destroy();
        bucket.destroy();
        assert!(bucket.is_destroyed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let config = BucketConfig {
            name: "stats".to_string(),
            capacity: 10,
            refill_interval_ms: 500,
        };
        let bucket = TokenBucket::from_config(&config).unwrap();
        assert!(bucket.try_acquire(3));

        let stats = bucket.stats();
        assert_eq!(stats.name, "stats");
        assert_eq!(stats.capacity, 10);
        assert_eq!(stats.available, 7);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.refill_interval_ms, 500);
        assert!(!stats.destroyed);
    }
}
