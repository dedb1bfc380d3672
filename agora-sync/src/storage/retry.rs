//! Bounded retry with backoff.
//!
//! The retry loop is an explicit state machine so the attempt bound and the
//! backoff schedule can be tested without a store:
//!
//! ```text
//!            ┌────────── resume() ───────────┐
//!            ▼                               │
//!      Attempt(n) ── ok ──► Success          │
//!            │                               │
//!            ├── transient, n < max ──► RetryableConflict(n, delay)
//!            ├── transient, n = max ──► Exhausted
//!            └── permanent ───────────► Failed
//! ```

use std::future::Future;
use std::time::Duration;

/// Classifies errors as worth retrying or not.
pub trait Transient {
    /// `true` for contention / temporary unavailability, `false` for errors
    /// that will fail the same way on every attempt.
    fn is_transient(&self) -> bool;
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before retry `i` (1-based) is `backoff_schedule[i - 1]`; the last
    /// entry repeats when the schedule is shorter than the attempts.
    pub backoff_schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(50), Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// Doubling delays starting at `base`, capped at `max`.
    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        let retries = max_attempts.saturating_sub(1);
        let backoff_schedule = (0..retries)
            .map(|i| {
                let multiplier = 1u32.checked_shl(i).unwrap_or(u32::MAX);
                base.saturating_mul(multiplier).min(max)
            })
            .collect();
        Self {
            max_attempts,
            backoff_schedule,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_schedule: vec![delay],
        }
    }

    /// Retry immediately (tests, in-memory stores).
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Effective attempt bound.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_schedule
            .get(index)
            .or_else(|| self.backoff_schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Retry loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// About to run attempt `number` (1-based)
    Attempt { number: u32 },
    Success { attempts: u32 },
    /// Attempt failed transiently; wait `delay`, then `resume()`
    RetryableConflict { attempt: u32, delay: Duration },
    /// Transient failures used up every attempt
    Exhausted { attempts: u32 },
    /// Permanent failure; never retried
    Failed { attempts: u32 },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Success { .. } | RetryState::Exhausted { .. } | RetryState::Failed { .. }
        )
    }
}

/// Drives [`RetryState`] transitions for one operation.
#[derive(Debug)]
pub struct RetryMachine<'a> {
    policy: &'a RetryPolicy,
    state: RetryState,
}

impl<'a> RetryMachine<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempt { number: 1 },
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// The current attempt succeeded.
    pub fn on_success(&mut self) -> RetryState {
        if let RetryState::Attempt { number } = self.state {
            self.state = RetryState::Success { attempts: number };
        }
        self.state
    }

    /// The current attempt failed.
    pub fn on_failure(&mut self, transient: bool) -> RetryState {
        if let RetryState::Attempt { number } = self.state {
            self.state = if !transient {
                RetryState::Failed { attempts: number }
            } else if number >= self.policy.attempts() {
                RetryState::Exhausted { attempts: number }
            } else {
                RetryState::RetryableConflict {
                    attempt: number,
                    delay: self.policy.delay_after(number),
                }
            };
        }
        self.state
    }

    /// Backoff elapsed; move on to the next attempt.
    pub fn resume(&mut self) -> RetryState {
        if let RetryState::RetryableConflict { attempt, .. } = self.state {
            self.state = RetryState::Attempt { number: attempt + 1 };
        }
        self.state
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts `policy`.
///
/// Each attempt calls `operation` afresh, so a read-modify-write closure is
/// redone from scratch after a conflict. The last error is returned.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut machine = RetryMachine::new(policy);
    loop {
        match operation().await {
            Ok(value) => {
                if let RetryState::Success { attempts } = machine.on_success() {
                    if attempts > 1 {
                        log::debug!("{label} succeeded after {attempts} attempts");
                    }
                }
                return Ok(value);
            }
            Err(err) => match machine.on_failure(err.is_transient()) {
                RetryState::RetryableConflict { attempt, delay } => {
                    log::debug!("{label} attempt {attempt} failed ({err}); retrying in {delay:?}");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    machine.resume();
                }
                RetryState::Exhausted { attempts } => {
                    log::error!("{label} gave up after {attempts} attempts: {err}");
                    return Err(err);
                }
                _ => return Err(err),
            },
        }
    }
}
