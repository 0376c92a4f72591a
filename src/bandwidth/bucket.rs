//! Lock-free token bucket
//!
//! Tokens are bytes. The bucket refills continuously at `rate` bytes per
//! second and holds at most one second worth of tokens. A rate of 0 means
//! unlimited: every acquisition succeeds immediately.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Shared token bucket; clones share the same state
#[derive(Clone, Debug)]
pub struct TokenBucket {
    inner: Arc<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Refill rate in bytes per second (0 = unlimited)
    rate: AtomicU64,
    /// Tokens currently available
    tokens: AtomicU64,
    /// Monotonic timestamp up to which refill has been credited
    credited_until: AtomicU64,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate_bps` (None = unlimited), starting full
    #[must_use]
    pub fn new(rate_bps: Option<u64>) -> Self {
        let rate = rate_bps.unwrap_or(0);
        Self {
            inner: Arc::new(BucketState {
                rate: AtomicU64::new(rate),
                tokens: AtomicU64::new(rate),
                credited_until: AtomicU64::new(monotonic_nanos()),
            }),
        }
    }

    /// Current rate, None when unlimited
    pub fn rate(&self) -> Option<u64> {
        match self.inner.rate.load(Ordering::Relaxed) {
            0 => None,
            r => Some(r),
        }
    }

    /// Change the rate; takes effect for waiting acquirers within one sleep slice
    pub fn set_rate(&self, rate_bps: Option<u64>) {
        let new_rate = rate_bps.unwrap_or(0);
        let old_rate = self.inner.rate.swap(new_rate, Ordering::SeqCst);
        if new_rate == 0 || new_rate == old_rate {
            return;
        }
        if old_rate == 0 {
            // Coming from unlimited: start with a full bucket
            self.inner.tokens.store(new_rate, Ordering::SeqCst);
            self.inner
                .credited_until
                .store(monotonic_nanos(), Ordering::SeqCst);
            return;
        }
        let _ = self
            .inner
            .tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                if new_rate > old_rate {
                    Some((t + (new_rate - old_rate)).min(new_rate))
                } else {
                    Some(t.min(new_rate))
                }
            });
    }

    /// Tokens available right now (u64::MAX when unlimited)
    pub fn available(&self) -> u64 {
        if self.inner.rate.load(Ordering::Relaxed) == 0 {
            return u64::MAX;
        }
        self.refill();
        self.inner.tokens.load(Ordering::SeqCst)
    }

    /// Take `bytes` tokens if all of them are available
    pub fn try_acquire(&self, bytes: u64) -> bool {
        if bytes == 0 || self.inner.rate.load(Ordering::Relaxed) == 0 {
            return true;
        }
        self.refill();
        self.inner
            .tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| t.checked_sub(bytes))
            .is_ok()
    }

    /// Wait until `bytes` tokens have been taken
    ///
    /// Tokens are taken as they become available, so requests larger than the
    /// bucket still complete.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;

        while remaining > 0 {
            // Re-read each round so rate changes apply to waiting acquirers
            let rate = self.inner.rate.load(Ordering::Relaxed);
            if rate == 0 {
                return;
            }

            self.refill();
            let taken = self
                .inner
                .tokens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                    (t > 0).then(|| t - t.min(remaining))
                })
                .map(|before| before.min(remaining))
                .unwrap_or(0);
            remaining -= taken;
            if remaining == 0 {
                return;
            }

            let wait_ms = remaining.saturating_mul(1000) / rate;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(5, 100))).await;
        }
    }

    /// Credit tokens for the time elapsed since the last refill
    fn refill(&self) {
        let rate = self.inner.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }

        let now = monotonic_nanos();
        let since = self.inner.credited_until.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(since) as u128;
        let earned = elapsed * rate as u128 / NANOS_PER_SEC;
        if earned == 0 {
            return;
        }

        // Advance only by the time actually converted to tokens so
        // fractional bytes are not lost between refills
        let spent = (earned * NANOS_PER_SEC / rate as u128) as u64;
        if self
            .inner
            .credited_until
            .compare_exchange(since, since + spent, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let earned = earned.min(u64::MAX as u128) as u64;
        let _ = self
            .inner
            .tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_add(earned).min(rate))
            });
    }

    #[cfg(test)]
    pub(crate) fn drain(&self) {
        self.inner.tokens.store(0, Ordering::SeqCst);
        self.inner
            .credited_until
            .store(monotonic_nanos(), Ordering::SeqCst);
    }
}

fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_bucket_reports_no_rate() {
        let bucket = TokenBucket::new(None);
        assert_eq!(bucket.rate(), None);
        assert_eq!(bucket.available(), u64::MAX);
        assert!(bucket.try_acquire(u64::MAX));
    }

    #[test]
    fn new_bucket_starts_full() {
        let bucket = TokenBucket::new(Some(1_000));
        assert_eq!(bucket.rate(), Some(1_000));
        assert!(bucket.try_acquire(1_000));
        assert!(!bucket.try_acquire(1_000), "bucket holds one second of tokens");
    }

    #[test]
    fn lowering_rate_clamps_tokens() {
        let bucket = TokenBucket::new(Some(10_000));
        bucket.set_rate(Some(100));
        assert!(bucket.available() <= 100);
    }

    #[test]
    fn limited_unlimited_limited_transition() {
        let bucket = TokenBucket::new(Some(500));
        bucket.set_rate(None);
        assert_eq!(bucket.rate(), None);
        bucket.set_rate(Some(2_000));
        assert_eq!(bucket.rate(), Some(2_000));
        assert!(bucket.try_acquire(2_000));
    }

    #[test]
    fn clones_share_state() {
        let bucket = TokenBucket::new(Some(1_000));
        let other = bucket.clone();
        assert!(other.try_acquire(1_000));
        assert!(!bucket.try_acquire(500));
        other.set_rate(Some(5_000));
        assert_eq!(bucket.rate(), Some(5_000));
    }

    #[tokio::test]
    async fn acquire_zero_and_unlimited_return_immediately() {
        let start = Instant::now();
        TokenBucket::new(Some(1)).acquire(0).await;
        TokenBucket::new(None).acquire(10_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(Some(1_000));
        bucket.drain();

        let start = Instant::now();
        bucket.acquire(500).await;
        let elapsed = start.elapsed();

        // 500 bytes at 1000 B/s is ~500ms; generous bounds for CI
        assert!(
            elapsed >= Duration::from_millis(250),
            "acquire returned too early: {:?}",
            elapsed
        );
        assert!(
            elapsed <= Duration::from_millis(1_500),
            "acquire took too long: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn concurrent_acquirers_share_the_rate() {
        let bucket = TokenBucket::new(Some(2_000));
        bucket.drain();

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move { bucket.acquire(500).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 2000 bytes total at 2000 B/s is ~1s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "too fast: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(3), "too slow: {:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_the_rate_unblocks_waiters() {
        let bucket = TokenBucket::new(Some(10));
        bucket.drain();

        let waiter = bucket.clone();
        let handle = tokio::spawn(async move { waiter.acquire(100_000).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bucket.set_rate(None);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should finish once unlimited")
            .unwrap();
    }
}
