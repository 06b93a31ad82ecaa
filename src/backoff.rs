//! Shared retry backoff policy
//!
//! Workers share one structured policy instead of per-worker delay tables.

use std::time::Duration;

/// Capped exponential backoff described by `{base, factor, cap, step_count}`.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Number of distinct steps before the delay pins at `cap`.
    pub step_count: u32,
}

impl Policy {
    /// Policy used by the metadata stream worker. Produces the sequence
    /// 3, 3, 5, 10, 20, 30, 60, 120, 300, 300… seconds (rounded).
    pub fn metadata_stream() -> Self {
        Policy {
            base: Duration::from_secs(3),
            factor: 1.8,
            cap: Duration::from_secs(300),
            step_count: 9,
        }
    }

    /// Policy used by the IMAP workers between failed sync attempts.
    pub fn imap_worker() -> Self {
        Policy {
            base: Duration::from_secs(2),
            factor: 2.0,
            cap: Duration::from_secs(120),
            step_count: 7,
        }
    }

    /// Short doubling schedule for the sent-folder placement probe.
    pub fn sent_folder_probe() -> Self {
        Policy {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(8),
            step_count: 4,
        }
    }

    /// Delay for the given zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let step = attempt.min(self.step_count);
        let secs = self.base.as_secs_f64() * self.factor.powi(step as i32);
        let capped = secs.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Attempt counter bound to a policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: Policy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: Policy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// The delay to sleep before the next retry; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let p = Policy::imap_worker();
        assert_eq!(p.delay(0), Duration::from_secs(2));
        assert_eq!(p.delay(1), Duration::from_secs(4));
        assert!(p.delay(10) <= Duration::from_secs(120));
        assert_eq!(p.delay(10), p.delay(20));
    }

    #[test]
    fn metadata_stream_schedule_approximates_legacy_table() {
        let p = Policy::metadata_stream();
        let delays: Vec<u64> = (0..10).map(|a| p.delay(a).as_secs()).collect();
        // First retries stay in single-digit seconds, later ones pin at 300.
        assert!(delays[0] == 3);
        assert!(delays[2] >= 5 && delays[2] <= 12);
        assert_eq!(*delays.last().unwrap(), 300);
        for w in delays.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn backoff_counter_advances_and_resets() {
        let mut b = Backoff::new(Policy::sent_folder_probe());
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }
}
