use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Maximum number of caller entries tracked before idle entries are swept.
const SWEEP_THRESHOLD: usize = 4096;

/// Sliding-window admission limiter keyed by caller identity.
///
/// Each caller gets at most `max` admitted calls within any trailing
/// `window`. Timestamps older than the window are discarded on every check,
/// so a caller that stops hammering regains its full budget after one
/// window. Thread-safe via an internal mutex; checks are O(max) per caller.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    inner: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max as usize,
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Records an admission attempt for `caller`. Returns `true` when the
    /// call is within budget (and counts it), `false` when the caller is
    /// over the window limit (the rejected call is not counted).
    pub fn check(&self, caller: &str) -> bool {
        let now = Instant::now();
        let mut map = self.inner.lock();

        // Bound memory: once enough callers are tracked, drop entries whose
        // every hit has aged out of the window.
        if map.len() >= SWEEP_THRESHOLD {
            let window = self.window;
            map.retain(|_, hits| {
                while let Some(front) = hits.front() {
                    if now.duration_since(*front) >= window {
                        hits.pop_front();
                    } else {
                        break;
                    }
                }
                !hits.is_empty()
            });
        }

        let hits = map.entry(caller.to_string()).or_default();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.max {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Number of callers currently tracked.
    pub fn tracked_callers(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_within_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        for i in 0..5 {
            assert!(limiter.check("1.2.3.4"), "call {i} should be admitted");
        }
        assert!(!limiter.check("1.2.3.4"), "6th call should be rejected");
    }

    #[test]
    fn callers_are_independent() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));

        assert!(limiter.check("b"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("b"));
    }

    #[test]
    fn rejected_calls_do_not_consume_budget() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        // Hammering while rejected must not extend the lockout.
        for _ in 0..10 {
            assert!(!limiter.check("a"));
        }
        // Backdate the recorded hit past the window; budget returns.
        {
            let mut map = limiter.inner.lock();
            let hits = map.get_mut("a").unwrap();
            for t in hits.iter_mut() {
                *t -= Duration::from_secs(61);
            }
        }
        assert!(limiter.check("a"));
    }

    #[test]
    fn window_slides_per_hit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));

        // Expire only the older of the two hits: exactly one slot frees up.
        {
            let mut map = limiter.inner.lock();
            let hits = map.get_mut("a").unwrap();
            *hits.front_mut().unwrap() -= Duration::from_secs(61);
        }
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn short_window_recovers() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("a"));
    }

    #[test]
    fn tracked_callers_counts_entries() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        limiter.check("a");
        limiter.check("b");
        assert_eq!(limiter.tracked_callers(), 2);
    }
}
