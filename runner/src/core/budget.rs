//! Time budget helpers for agent attempts.

use std::time::Duration;

/// Per-attempt timeout: twice the estimate, never below `min`.
///
/// Estimates too large for a `Duration` saturate at `Duration::MAX`.
pub fn task_timeout(estimated_minutes: Option<f64>, min: Duration) -> Duration {
    let estimate = estimated_minutes
        .filter(|m| m.is_finite() && *m > 0.0)
        .map(|m| Duration::try_from_secs_f64(m * 2.0 * 60.0).unwrap_or(Duration::MAX))
        .unwrap_or(Duration::ZERO);
    estimate.max(min)
}
