//! Retry budget accounting.
//!
//! A phase gets one initial cycle plus `max_retries` further cycles. The
//! attempt counter is incremented once per failed cycle, before the budget is
//! consulted.

/// What to do after a cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget remains; run another cycle.
    Retry,
    /// `attempts` failed cycles exceed the budget; the phase is failed.
    Exhausted,
}

/// Decide the next step given the attempt count *after* recording a failure.
pub fn after_failed_cycle(attempts: u32, max_retries: u32) -> RetryDecision {
    if attempts > max_retries {
        RetryDecision::Exhausted
    } else {
        RetryDecision::Retry
    }
}

/// True if a phase resumed with `attempts` recorded failures may still run.
pub fn has_budget(attempts: u32, max_retries: u32) -> bool {
    attempts <= max_retries
}
