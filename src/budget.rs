//! Per-search wall-clock budget.
//!
//! A metasearch query fans out to many engines under one overall deadline.
//! The budget is an explicit value passed in [`crate::RequestOptions`]
//! rather than ambient per-thread state: the session uses it to fill a
//! missing request timeout, and to decide whether a transfer that completed
//! — but too late for the search that asked for it — should still surface
//! as a timeout.

use std::time::{Duration, Instant};

/// Grace added on top of a budget before a completed-but-slow transfer is
/// reclassified as a timeout.
pub const TIMEOUT_OVERHEAD: Duration = Duration::from_millis(200);

/// A wall-clock budget shared by all requests of one search.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    total: Duration,
}

impl TimeBudget {
    /// Start a budget now.
    pub fn start(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    /// A budget that started at an earlier instant (e.g. when the user's
    /// search began, before any engine request was issued).
    pub fn started_at(started: Instant, total: Duration) -> Self {
        Self { started, total }
    }

    /// The full budget duration.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Time spent since the budget started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the budget runs out, floored at zero.
    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    /// Whether the budget plus the given grace has been spent.
    pub fn exceeded(&self, overhead: Duration) -> bool {
        self.elapsed() > self.total + overhead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_budget_has_full_remaining() {
        let budget = TimeBudget::start(Duration::from_secs(5));
        assert!(budget.remaining() > Duration::from_secs(4));
        assert!(!budget.exceeded(Duration::ZERO));
    }

    #[test]
    fn old_budget_is_exceeded() {
        let started = Instant::now() - Duration::from_millis(500);
        let budget = TimeBudget::started_at(started, Duration::from_millis(100));
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(budget.exceeded(TIMEOUT_OVERHEAD));
    }

    #[test]
    fn overhead_grants_grace() {
        let started = Instant::now() - Duration::from_millis(250);
        let budget = TimeBudget::started_at(started, Duration::from_millis(200));
        // 50ms over budget but within the 200ms overhead allowance.
        assert!(!budget.exceeded(TIMEOUT_OVERHEAD));
        assert!(budget.exceeded(Duration::ZERO));
    }
}
