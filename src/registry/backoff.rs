// src/registry/backoff.rs

//! Retry policy for optimistic-concurrency loops.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Cap applied to every computed delay.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0`).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(10),
            max: Duration::from_millis(500),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Bounded retry settings for process ID allocation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IdRetry {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl Default for IdRetry {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let p = BackoffPolicy::default();
        assert_eq!(p.next(0), Duration::from_millis(10));
        assert_eq!(p.next(1), Duration::from_millis(20));
        assert_eq!(p.next(3), Duration::from_millis(80));
        assert_eq!(p.next(10), Duration::from_millis(500));
        assert_eq!(p.next(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn factor_below_one_is_constant() {
        let p = BackoffPolicy {
            factor: 0.5,
            ..BackoffPolicy::default()
        };
        assert_eq!(p.next(5), Duration::from_millis(10));
    }
}
