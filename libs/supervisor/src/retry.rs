//! Exponential backoff with a retry budget.
//!
//! The base period doubles with each consumed retry and the actual wait is
//! uniformly jittered within `(0, base * 2^retries]` so that a fleet of
//! disconnected tunnels does not reconnect in lock-step.

use std::time::Duration;

use rand::Rng as _;
use tokio::time::Instant;

pub const DEFAULT_BASE_TIME: Duration = Duration::from_secs(1);

pub struct BackoffHandler {
    max_retries: u32,
    base_time: Duration,
    /// Caps the backoff period according to `max_retries` but keeps
    /// retrying indefinitely.
    retry_forever: bool,

    retries: u32,
    /// Once this deadline passes, the next consultation starts over from
    /// zero retries.
    reset_deadline: Option<Instant>,
}

impl BackoffHandler {
    pub fn new(max_retries: u32, base_time: Duration, retry_forever: bool) -> Self {
        Self {
            max_retries,
            base_time,
            retry_forever,
            retries: 0,
            reset_deadline: None,
        }
    }

    /// The maximum time until the next retry and whether more retries
    /// remain. Does not mutate the handler.
    pub fn max_backoff_duration(&self) -> (Duration, bool) {
        let retries = self.effective_retries();

        if retries >= self.max_retries && !self.retry_forever {
            return (Duration::ZERO, false);
        }

        (self.max_wait_after(retries), true)
    }

    /// Consumes a retry and returns the jittered wait until the next
    /// attempt is due, or `None` if the budget is used up.
    pub fn backoff_timer(&mut self) -> Option<tokio::time::Sleep> {
        if self
            .reset_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            self.retries = 0;
            self.reset_deadline = None;
        }

        if self.retries >= self.max_retries {
            if !self.retry_forever {
                return None;
            }
        } else {
            self.retries += 1;
        }

        Some(tokio::time::sleep(jitter(self.max_wait_after(self.retries))))
    }

    pub fn reached_max_retries(&self) -> bool {
        self.effective_retries() >= self.max_retries
    }

    pub fn retries(&self) -> u32 {
        self.effective_retries()
    }

    /// Makes the next consultation start over from zero retries.
    pub fn reset_now(&mut self) {
        self.reset_deadline = Some(Instant::now());
    }

    /// Keeps the current backoff state for one more (jittered) backoff
    /// period; after that the retry counter starts over. Returns the
    /// length of the grace period.
    pub fn set_grace_period(&mut self) -> Duration {
        let wait = jitter(self.max_wait_after(self.effective_retries() + 1));
        self.reset_deadline = Some(Instant::now() + wait);

        wait
    }

    fn effective_retries(&self) -> u32 {
        match self.reset_deadline {
            Some(deadline) if Instant::now() >= deadline => 0,
            Some(_) | None => self.retries,
        }
    }

    fn max_wait_after(&self, retries: u32) -> Duration {
        let base = if self.base_time.is_zero() {
            DEFAULT_BASE_TIME
        } else {
            self.base_time
        };

        base.saturating_mul(1u32.checked_shl(retries.saturating_add(1)).unwrap_or(u32::MAX))
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return max;
    }

    let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);

    Duration::from_nanos(rand::thread_rng().gen_range(1..=nanos))
}
