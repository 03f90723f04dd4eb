//! Bounded polling.
//!
//! Every wait in the harness is a fixed-interval retry loop with an explicit
//! deadline. An attempt either produces a value or reports what it saw
//! instead; failed queries are reported the same way. Only the deadline ends
//! the loop unsuccessfully.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Interval and total bound of a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Total time allowed.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Validates the policy.
    ///
    /// # Errors
    /// Returns a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("poll interval must be non-zero".to_string());
        }
        if self.timeout < self.interval {
            return Err(format!(
                "timeout {:?} is shorter than interval {:?}",
                self.timeout, self.interval
            ));
        }
        Ok(())
    }
}

/// Result of one polling attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not yet; carries a description of what was observed.
    NotYet(String),
}

/// The deadline of a polling loop elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollExpired {
    /// Time spent.
    pub elapsed: Duration,
    /// Attempts made.
    pub attempts: u32,
    /// What the last attempt observed.
    pub last_observation: String,
}

/// Polls `attempt` until it is ready or `policy.timeout` elapses.
///
/// Each attempt is itself cut off at the deadline, so a hanging request
/// cannot hold the loop past its bound.
///
/// # Errors
/// Returns [`PollExpired`] when the deadline passes first.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: PollPolicy,
    mut attempt: F,
) -> Result<T, PollExpired>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut attempts = 0u32;
    let mut last_observation = String::from("no attempt completed");

    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, attempt()).await {
            Ok(Attempt::Ready(value)) => {
                trace!(what, attempts, elapsed = ?start.elapsed(), "poll satisfied");
                return Ok(value);
            }
            Ok(Attempt::NotYet(observation)) => {
                trace!(what, attempts, %observation, "poll not yet satisfied");
                last_observation = observation;
            }
            Err(_) => {
                last_observation = "attempt did not complete before the deadline".to_string();
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollExpired {
                elapsed: now - start,
                attempts,
                last_observation,
            });
        }
        tokio::time::sleep_until((now + policy.interval).min(deadline)).await;
    }
}
