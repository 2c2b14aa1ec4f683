//! Retry policy for failing action steps.
//!
//! Stateless: the caller tracks the attempt counter. A workflow's
//! `retry_attempts` grants that many extra invocations after the first.

/// Stateless retry handler for action step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Total invocations allowed for a workflow's `retry_attempts`.
    pub fn max_attempts(retry_attempts: u32) -> u32 {
        retry_attempts.saturating_add(1)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(retry_attempts: u32, attempt: u32) -> bool {
        attempt < Self::max_attempts(retry_attempts)
    }
}
