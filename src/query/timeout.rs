//! Query deadlines
//!
//! A deadline is polled at suspension points rather than enforced
//! preemptively. Besides wall-clock deadlines there is a synthesized
//! variant that expires after a fixed number of polls, which keeps
//! timeout behavior reproducible regardless of machine speed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::TimeoutPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    polls_left: Option<Arc<AtomicI64>>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
            polls_left: None,
        }
    }

    /// Deadline from a millisecond budget; zero disables it.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::none()
        } else {
            Self::after(Duration::from_millis(ms))
        }
    }

    /// A deadline that is already in the past.
    pub fn expired() -> Self {
        Self::after_polls(0)
    }

    /// Expires once it has been polled `n` times.
    pub fn after_polls(n: u64) -> Self {
        Self {
            at: None,
            polls_left: Some(Arc::new(AtomicI64::new(n as i64))),
        }
    }

    pub fn is_set(&self) -> bool {
        self.at.is_some() || self.polls_left.is_some()
    }

    pub fn is_expired(&self) -> bool {
        if let Some(polls) = &self.polls_left {
            if polls.fetch_sub(1, Ordering::Relaxed) <= 0 {
                return true;
            }
        }
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    /// Remaining wall-clock budget, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Polls a deadline every `every` ticks.
#[derive(Debug, Clone)]
pub struct TimeoutCheck {
    deadline: Deadline,
    every: usize,
    ticks: usize,
    expired: bool,
}

impl TimeoutCheck {
    pub fn new(deadline: Deadline, every: usize) -> Self {
        Self {
            deadline,
            every: every.max(1),
            ticks: 0,
            expired: false,
        }
    }

    /// Count one unit of work; returns true once the deadline has passed.
    pub fn tick(&mut self) -> bool {
        if self.expired {
            return true;
        }
        if !self.deadline.is_set() {
            return false;
        }
        self.ticks += 1;
        if self.ticks >= self.every {
            self.ticks = 0;
            self.expired = self.deadline.is_expired();
        }
        self.expired
    }

    /// Poll immediately regardless of the tick count.
    pub fn poll_now(&mut self) -> bool {
        if !self.expired && self.deadline.is_set() {
            self.expired = self.deadline.is_expired();
        }
        self.expired
    }

    pub fn expired(&self) -> bool {
        self.expired
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }
}

/// Outcome of work that can be cut short by a deadline
#[derive(Debug, Clone, PartialEq)]
pub struct Partial<T> {
    pub value: T,
    pub timed_out: bool,
}

impl<T> Partial<T> {
    pub fn complete(value: T) -> Self {
        Self {
            value,
            timed_out: false,
        }
    }

    pub fn truncated(value: T) -> Self {
        Self {
            value,
            timed_out: true,
        }
    }

    /// Apply the timeout policy: FAIL turns a truncated result into an error.
    pub fn resolve(self, policy: TimeoutPolicy) -> Result<Self> {
        if self.timed_out && policy == TimeoutPolicy::Fail {
            return Err(Error::Timeout);
        }
        Ok(self)
    }
}
