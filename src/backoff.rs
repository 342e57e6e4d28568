//! Per-object exponential backoff for failed reconciles.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_retry2::strategy::jitter_range;

// Beyond this many consecutive failures the delay is pinned at the cap anyway.
const MAX_TRACKED_FAILURES: u32 = 32;

const MIN_BASE: Duration = Duration::from_millis(1);

// An object that neither failed nor succeeded for this many cap periods was
// deleted while failing; its retry never ran.
const STALE_AFTER_CAPS: u32 = 4;

#[derive(Debug)]
struct Failures {
    count: u32,
    last: Instant,
}

#[derive(Debug)]
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, Failures>>,
}

impl ErrorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_BASE);
        Self {
            base,
            max: max.max(base),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Upper bound of the delay after `failures` consecutive failures:
    /// `base * 2^(failures - 1)`, capped at `max`.
    pub fn ceiling(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(MAX_TRACKED_FAILURES - 1);
        self.base.saturating_mul(1 << doublings).min(self.max)
    }

    /// Records a failure for `key` and returns how long to wait before retrying.
    ///
    /// The delay lies between half of the ceiling and the ceiling, and never
    /// exceeds the cap.
    pub fn next_delay(&self, key: &str) -> Duration {
        let now = Instant::now();
        let stale_after = self.max.saturating_mul(STALE_AFTER_CAPS);
        let failures = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            failures.retain(|k, f| k == key || now.duration_since(f.last) <= stale_after);
            let entry = failures.entry(key.to_owned()).or_insert(Failures {
                count: 0,
                last: now,
            });
            entry.count = (entry.count + 1).min(MAX_TRACKED_FAILURES);
            entry.last = now;
            entry.count
        };
        let ceiling = self.ceiling(failures);
        (ceiling / 2 + jitter_range(0.0, 1.0)(ceiling / 2)).min(ceiling)
    }

    /// Forgets the failures of `key` after a successful reconcile.
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Number of objects with failures on record.
    pub fn tracked(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ErrorBackoff {
        ErrorBackoff::new(Duration::from_secs(5), Duration::from_secs(60))
    }

    #[test]
    fn ceiling_doubles_until_capped() {
        let b = backoff();
        assert_eq!(b.ceiling(1), Duration::from_secs(5));
        assert_eq!(b.ceiling(2), Duration::from_secs(10));
        assert_eq!(b.ceiling(3), Duration::from_secs(20));
        assert_eq!(b.ceiling(5), Duration::from_secs(60));
        assert_eq!(b.ceiling(MAX_TRACKED_FAILURES), Duration::from_secs(60));
    }

    #[test]
    fn odd_and_tiny_bases_keep_their_value() {
        let b = ErrorBackoff::new(Duration::from_millis(3), Duration::from_secs(1));
        assert_eq!(b.ceiling(1), Duration::from_millis(3));
        assert_eq!(b.ceiling(2), Duration::from_millis(6));

        let b = ErrorBackoff::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(b.ceiling(1), Duration::from_millis(1));
        assert!(b.next_delay("a") > Duration::ZERO);
    }

    #[tokio::test]
    async fn delays_stay_between_half_ceiling_and_cap() {
        let b = backoff();
        for attempt in 1..=200u32 {
            let ceiling = b.ceiling(attempt.min(MAX_TRACKED_FAILURES));
            let delay = b.next_delay("a");
            assert!(delay >= ceiling / 2, "attempt {attempt}: {delay:?}");
            assert!(delay <= ceiling, "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(60), "attempt {attempt}: {delay:?}");
        }
    }

    #[tokio::test]
    async fn delays_grow_per_key_and_reset() {
        let b = backoff();
        for _ in 0..3 {
            b.next_delay("a");
        }
        let delay = b.next_delay("a");
        assert!(delay >= Duration::from_secs(20) && delay <= Duration::from_secs(40));

        let other = b.next_delay("b");
        assert!(other <= Duration::from_secs(5));

        b.reset("a");
        assert!(b.next_delay("a") <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_keys_are_pruned() {
        let b = backoff();
        b.next_delay("deleted");
        b.next_delay("alive");
        assert_eq!(b.tracked(), 2);

        tokio::time::advance(Duration::from_secs(60 * 4 + 1)).await;
        b.next_delay("alive");

        assert_eq!(b.tracked(), 1);
        assert!(b.next_delay("deleted") <= Duration::from_secs(5));
    }
}
