//! Retry policy for failed task attempts.

use std::time::Duration;

/// Error substrings that mark a failure as not worth re-attempting.
pub const DEFAULT_NON_RETRYABLE: &[&str] = &[
    "invalid api key",
    "authentication",
    "unauthorized",
    "permission denied",
    "command not found",
    "quota exceeded",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the task after `delay`.
    Retry { delay: Duration },
    /// Record the outcome as terminal for this run.
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
    non_retryable: Vec<String>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration, non_retryable: &[String]) -> Self {
        Self {
            max_retries,
            backoff,
            non_retryable: non_retryable
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide what happens after attempt number `attempt` (1-based) finished.
    ///
    /// Backoff grows linearly with the attempt count.
    pub fn decide(&self, success: bool, attempt: u32, error: Option<&str>) -> RetryDecision {
        if success || attempt >= self.max_retries {
            return RetryDecision::Final;
        }
        if error.is_some_and(|e| self.is_non_retryable(e)) {
            return RetryDecision::Final;
        }
        RetryDecision::Retry {
            delay: self.backoff.saturating_mul(attempt.max(1)),
        }
    }

    pub fn is_non_retryable(&self, error: &str) -> bool {
        let lowered = error.to_lowercase();
        self.non_retryable.iter().any(|p| lowered.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        let patterns: Vec<String> = DEFAULT_NON_RETRYABLE.iter().map(|s| s.to_string()).collect();
        RetryPolicy::new(max_retries, Duration::from_millis(1000), &patterns)
    }

    #[test]
    fn success_is_final() {
        assert_eq!(policy(2).decide(true, 1, None), RetryDecision::Final);
    }

    #[test]
    fn failure_below_budget_retries_with_linear_backoff() {
        let p = policy(3);
        assert_eq!(
            p.decide(false, 1, Some("boom")),
            RetryDecision::Retry {
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            p.decide(false, 2, Some("boom")),
            RetryDecision::Retry {
                delay: Duration::from_millis(2000)
            }
        );
    }

    #[test]
    fn failure_at_budget_is_final() {
        assert_eq!(policy(2).decide(false, 2, Some("boom")), RetryDecision::Final);
    }

    #[test]
    fn zero_retries_never_retries() {
        assert_eq!(policy(0).decide(false, 1, Some("boom")), RetryDecision::Final);
    }

    #[test]
    fn non_retryable_match_is_case_insensitive() {
        let p = policy(5);
        assert_eq!(
            p.decide(false, 1, Some("Error: Invalid API Key supplied")),
            RetryDecision::Final
        );
        assert!(p.is_non_retryable("sh: claude: command not found"));
        assert!(!p.is_non_retryable("tests failed"));
    }
}
