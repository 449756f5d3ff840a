//! Shutdown / reaper (C9): orderly cancellation, bounded drain, forced
//! reclaim of leaked transfers (spec.md §4.9).

use crate::constants::{DISCONNECT_DRAIN_BOUND, DISCONNECT_DRAIN_STEP};
use std::time::{Duration, Instant};

/// Tracks one device's progress through the disconnect sequence so the
/// manager's `process()` loop can drive it a step at a time instead of
/// blocking (spec.md §5: "no public operation blocks").
pub struct Drain {
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Keep pumping; not yet empty and not yet past the bound.
    Continue,
    /// Sets are empty — proceed straight to teardown.
    Drained,
    /// Past the bound with transfers still outstanding — force-reclaim.
    ForceReclaim,
}

impl Drain {
    pub fn start(now: Instant) -> Self {
        Self { deadline: now + DISCONNECT_DRAIN_BOUND }
    }

    pub fn step(&self) -> Duration {
        DISCONNECT_DRAIN_STEP
    }

    /// Evaluates drain progress given the current outstanding-transfer
    /// count, as observed after pumping one step (spec.md §4.9 steps 2-3).
    pub fn evaluate(&self, now: Instant, outstanding: usize) -> DrainOutcome {
        if outstanding == 0 {
            DrainOutcome::Drained
        } else if now >= self.deadline {
            DrainOutcome::ForceReclaim
        } else {
            DrainOutcome::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drained_as_soon_as_sets_are_empty() {
        let now = Instant::now();
        let drain = Drain::start(now);
        assert_eq!(drain.evaluate(now, 0), DrainOutcome::Drained);
    }

    #[test]
    fn continues_while_outstanding_and_within_bound() {
        let now = Instant::now();
        let drain = Drain::start(now);
        assert_eq!(drain.evaluate(now, 3), DrainOutcome::Continue);
    }

    #[test]
    fn force_reclaims_once_the_bound_elapses() {
        let now = Instant::now();
        let drain = Drain::start(now);
        let later = now + DISCONNECT_DRAIN_BOUND + Duration::from_millis(1);
        assert_eq!(drain.evaluate(later, 2), DrainOutcome::ForceReclaim);
    }
}
