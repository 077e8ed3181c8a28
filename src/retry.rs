use std::time::Duration;

use serde::Deserialize;

use crate::error::{AnalysisError, Result};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 50 }
fn default_multiplier() -> f32 { 2.0 }
fn default_max_backoff_ms() -> u64 { 1000 }

impl RetryPolicy {
    /// A policy that retries immediately. Used by tests and by callers that
    /// already sit behind their own pacing.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based: the delay after the
    /// first failure is `backoff(1)`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.initial_backoff_ms as f64 * (self.multiplier as f64).powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    /// Retry `op` while it fails with a transient error kind.
    pub fn run<T>(&self, op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        self.run_if(op, |e| e.kind().is_transient())
    }

    /// Retry `op` while `should_retry` accepts the error. Errors that are not
    /// retryable surface unchanged; retryable errors that outlast the budget
    /// surface as [`AnalysisError::MaxRetriesExceeded`].
    pub fn run_if<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T>,
        should_retry: impl Fn(&AnalysisError) -> bool,
    ) -> Result<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if !should_retry(&err) => return Err(err),
                Err(err) if attempt >= attempts => {
                    return Err(AnalysisError::MaxRetriesExceeded {
                        attempts,
                        last: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, attempts, err, delay
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 300,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(9), Duration::from_millis(300));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let policy = RetryPolicy::immediate(3);
        let mut calls = 0;
        let out = policy.run(|_| {
            calls += 1;
            if calls < 3 {
                Err(AnalysisError::DeviceResourcesUnavailable("busy".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(out, Ok(7));
        assert_eq!(calls, 3);
    }

    #[test]
    fn data_shape_errors_fail_fast() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let out: Result<()> = policy.run(|_| {
            calls += 1;
            Err(AnalysisError::InsufficientAudioData("empty".into()))
        });
        assert_eq!(calls, 1);
        assert!(matches!(out, Err(AnalysisError::InsufficientAudioData(_))));
    }

    #[test]
    fn exhausted_budget_surfaces_max_retries() {
        let policy = RetryPolicy::immediate(2);
        let out: Result<()> =
            policy.run(|_| Err(AnalysisError::BufferProcessingFailed("io".into())));
        match out {
            Err(AnalysisError::MaxRetriesExceeded { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
