//! Request/poll/cleanup building blocks shared by the backends.
//!
//! Every backend follows the same shape: issue a creation request, wait
//! for readiness with a bounded retry policy, register the result in the
//! inventory, and destroy whatever was half created when anything fails.
//! This module holds the two waiting strategies and the cleanup wrapper.
//!
//! - [`LinearBackoff`]: wall-clock bounded polling with a linear ramp.
//! - [`ExponentialBackoff`]: attempt bounded probing with doubling delays.
//! - [`with_cleanup`]: runs a fallible operation and a best-effort undo.

mod clock;

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;

pub use clock::{Clock, ManualClock, SystemClock};

/// Outcome of a single status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Polling policy with a linear ramp and a wall-clock deadline.
///
/// Attempt `n` (starting at 1) sleeps `n` seconds for `n <= ramp_limit`,
/// and `plateau` afterwards. The loop stops once `timeout` has elapsed
/// since polling started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub timeout: Duration,
    pub ramp_limit: u32,
    pub plateau: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(600))
    }
}

impl LinearBackoff {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ramp_limit: 10,
            plateau: Duration::from_secs(30),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= self.ramp_limit {
            Duration::from_secs(u64::from(attempt))
        } else {
            self.plateau
        }
    }

    /// Calls `poll` until it reports [`Poll::Ready`] or the deadline passes.
    ///
    /// Each call is preceded by the sleep for its attempt number. An `Err`
    /// from `poll` ends the loop immediately; only `Pending` is retried.
    /// Exhausting the deadline yields [`ProvisionError::Timeout`].
    pub fn poll<T, F>(&self, clock: &dyn Clock, mut poll: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<Poll<T>>,
    {
        let deadline = clock.now() + self.timeout;
        let mut attempt = 1;
        while clock.now() < deadline {
            let delay = self.delay_for_attempt(attempt);
            debug!("waiting {}s before poll attempt {}", delay.as_secs(), attempt);
            clock.sleep(delay);
            match poll(attempt)? {
                Poll::Ready(value) => {
                    info!("ready after {} poll attempt(s)", attempt);
                    return Ok(value);
                }
                Poll::Pending => attempt += 1,
            }
        }
        Err(ProvisionError::Timeout(format!(
            "unable to get a 200 response in {} seconds",
            self.timeout.as_secs()
        ))
        .into())
    }
}

/// Probe policy with exponential delays, bounded by an attempt count.
///
/// After the `k`-th failure the probe sleeps `2^k` seconds and runs again,
/// giving `retries + 2` probes in total before giving up. With
/// `retries == 0` the probe runs once and its failure is logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self { retries: 1 }
    }
}

impl ExponentialBackoff {
    pub fn delay_for_attempt(attempt: u32) -> Duration {
        Duration::from_secs(2u64.saturating_pow(attempt))
    }

    /// Runs `probe` until it succeeds or the retry budget is spent.
    ///
    /// The first probe runs at once, with no leading sleep, even when
    /// `retries == 0`; in that case a failure is only logged.
    ///
    /// `describe` names the awaited condition in the [`ProvisionError::Timeout`]
    /// raised on exhaustion.
    pub fn probe<F>(&self, clock: &dyn Clock, describe: &str, mut probe: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            let err = match probe() {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if self.retries == 0 {
                warn!("ignoring failed probe for {}: {:#}", describe, err);
                return Ok(());
            }
            if attempt > self.retries {
                return Err(ProvisionError::Timeout(format!(
                    "giving up waiting for {} after {} attempts: {:#}",
                    describe,
                    attempt + 1,
                    err
                ))
                .into());
            }

            attempt += 1;
            let delay = Self::delay_for_attempt(attempt);
            debug!("probe for {} failed, retrying in {}s: {:#}", describe, delay.as_secs(), err);
            clock.sleep(delay);
        }
    }
}

/// Runs `cleanup`, logging instead of returning its failure.
pub fn cleanup_best_effort<F>(what: &str, cleanup: F)
where
    F: FnOnce() -> Result<()>,
{
    info!("cleaning up {}", what);
    if let Err(e) = cleanup() {
        warn!("cleanup of {} failed: {:#}", what, e);
    }
}

/// Runs `op`; if it fails, runs `cleanup` best-effort and returns the original error.
pub fn with_cleanup<T, O, C>(what: &str, op: O, cleanup: C) -> Result<T>
where
    O: FnOnce() -> Result<T>,
    C: FnOnce() -> Result<()>,
{
    match op() {
        Ok(value) => Ok(value),
        Err(err) => {
            cleanup_best_effort(what, cleanup);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_linear_delays_ramp_then_plateau() {
        let policy = LinearBackoff::default();
        let delays: Vec<_> = (1..=12).map(|n| policy.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 30, 30]);
    }

    #[test]
    fn test_linear_poll_total_sleep_after_pending_replies() {
        // Ready on the 12th poll: 11 pending replies plus the accepted request.
        let clock = ManualClock::new();
        let polls = Cell::new(0);
        let value = LinearBackoff::default()
            .poll(&clock, |_| {
                polls.set(polls.get() + 1);
                Ok(if polls.get() < 12 {
                    Poll::Pending
                } else {
                    Poll::Ready("done")
                })
            })
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(clock.total_slept(), Duration::from_secs(55 + 30 * 2));
    }

    #[test]
    fn test_linear_poll_times_out() {
        let clock = ManualClock::new();
        let err = LinearBackoff::with_timeout(Duration::from_secs(10))
            .poll(&clock, |_| Ok(Poll::<()>::Pending))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Timeout(msg)) if msg.contains("10 seconds")
        ));
        assert_eq!(clock.sleeps(), secs(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_linear_poll_error_is_not_retried() {
        let clock = ManualClock::new();
        let calls = Cell::new(0);
        let result: Result<()> = LinearBackoff::default().poll(&clock, |_| {
            calls.set(calls.get() + 1);
            anyhow::bail!("not found")
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_exponential_total_sleep_after_failures() {
        let clock = ManualClock::new();
        let failures = Cell::new(2);
        ExponentialBackoff { retries: 3 }
            .probe(&clock, "c1", || {
                if failures.get() > 0 {
                    failures.set(failures.get() - 1);
                    anyhow::bail!("not running")
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(clock.sleeps(), secs(&[2, 4]));
    }

    #[test]
    fn test_exponential_gives_up_after_budget() {
        let clock = ManualClock::new();
        let calls = Cell::new(0);
        let err = ExponentialBackoff { retries: 1 }
            .probe(&clock, "fake:c1", || {
                calls.set(calls.get() + 1);
                anyhow::bail!("not running")
            })
            .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert_eq!(clock.sleeps(), secs(&[2, 4]));
        assert!(err.to_string().contains("giving up waiting for fake:c1"));
    }

    #[test]
    fn test_exponential_zero_retries_ignores_failure() {
        let clock = ManualClock::new();
        let calls = Cell::new(0);
        ExponentialBackoff { retries: 0 }
            .probe(&clock, "c1", || {
                calls.set(calls.get() + 1);
                anyhow::bail!("not running")
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_with_cleanup_keeps_original_error() {
        let cleaned = Cell::new(false);
        let err = with_cleanup(
            "container",
            || -> Result<()> { anyhow::bail!("start failed") },
            || {
                cleaned.set(true);
                anyhow::bail!("delete failed")
            },
        )
        .unwrap_err();
        assert!(cleaned.get());
        assert_eq!(err.to_string(), "start failed");
    }

    #[test]
    fn test_with_cleanup_skips_cleanup_on_success() {
        let cleaned = Cell::new(false);
        let value = with_cleanup(
            "container",
            || Ok(7),
            || {
                cleaned.set(true);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(value, 7);
        assert!(!cleaned.get());
    }
}
