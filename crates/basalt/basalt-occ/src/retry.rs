//! Retry bounds and backoff for the spin loops built on top of the primitives.
//!
//! The primitives never retry; contention comes back as a `bool`. Callers that
//! want "keep trying for a while" describe the bound with a [`RetryPolicy`].

use std::time::{Duration, Instant};

/// How long a spin loop may keep retrying.
///
/// Both bounds are optional; whichever is hit first ends the loop. With
/// neither set the loop spins until it succeeds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget measured from the first attempt.
    pub timeout: Option<Duration>,
    /// Attempts that only issue a CPU spin hint before the loop starts
    /// yielding its timeslice between attempts.
    pub spins_before_yield: u32,
}

impl RetryPolicy {
    const DEFAULT_SPINS: u32 = 64;

    /// Retry forever.
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: None,
            timeout: None,
            spins_before_yield: Self::DEFAULT_SPINS,
        }
    }

    /// Give up after `max_attempts` attempts.
    ///
    /// # Panics
    /// Panics if `max_attempts` is zero.
    ///
    /// # Example
    /// ```
    /// use basalt_occ::RetryPolicy;
    /// let policy = RetryPolicy::attempts(100);
    /// assert_eq!(policy.max_attempts, Some(100));
    /// ```
    pub const fn attempts(max_attempts: u32) -> Self {
        assert!(max_attempts > 0, "at least one attempt is required");
        Self {
            max_attempts: Some(max_attempts),
            timeout: None,
            spins_before_yield: Self::DEFAULT_SPINS,
        }
    }

    /// Give up once `timeout` has elapsed.
    pub const fn timeout(timeout: Duration) -> Self {
        Self {
            max_attempts: None,
            timeout: Some(timeout),
            spins_before_yield: Self::DEFAULT_SPINS,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub const fn with_spins_before_yield(mut self, spins: u32) -> Self {
        self.spins_before_yield = spins;
        self
    }

    pub(crate) fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
            started: Instant::now(),
        }
    }
}

impl Default for RetryPolicy {
    /// 5 seconds, the spin timeout writers historically used.
    fn default() -> Self {
        Self::timeout(Duration::from_secs(5))
    }
}

/// Running state of one retry loop.
pub(crate) struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    started: Instant,
}

impl Backoff {
    /// Records a failed attempt and waits a little.
    ///
    /// Returns `false` once the policy is exhausted; the caller should stop.
    #[inline]
    pub(crate) fn snooze(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);

        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return false;
            }
        }
        if let Some(limit) = self.policy.timeout {
            if self.started.elapsed() >= limit {
                return false;
            }
        }

        if self.attempts <= self.policy.spins_before_yield {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        true
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
