//! Step rebasing seam
//!
//! Transforming pending steps over missed diffs belongs to the external
//! step model; the state machine only decides *when* a rebase happens.

use pagesync_protocol::{CommittedDiff, Step};

/// Transform locally pending steps so they apply cleanly on top of diffs
/// the client missed.
pub trait StepRebaser {
    fn rebase(&self, pending: Vec<Step>, missed: &[CommittedDiff]) -> Vec<Step>;
}

/// Pass-through rebaser for step models whose steps commute (or for tests
/// that only exercise the sequencing machinery).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRebaser;

impl StepRebaser for IdentityRebaser {
    fn rebase(&self, pending: Vec<Step>, _missed: &[CommittedDiff]) -> Vec<Step> {
        pending
    }
}
