//! The scheduled-run transition table.

use crate::core::RunState;

/// Every permitted `(from, to)` pair.
pub const VALID_TRANSITIONS: [(RunState, RunState); 5] = [
    (RunState::Scheduled, RunState::Pending),
    (RunState::Pending, RunState::Running),
    (RunState::Running, RunState::Completed),
    (RunState::Running, RunState::Failed),
    (RunState::Running, RunState::Pending),
];

/// States reachable from `from` in one step.
#[must_use]
pub fn valid_targets(from: RunState) -> Vec<RunState> {
    VALID_TRANSITIONS
        .iter()
        .filter(|(f, _)| *f == from)
        .map(|(_, t)| *t)
        .collect()
}

/// Returns true if `from -> to` is in the table.
#[must_use]
pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
    VALID_TRANSITIONS.contains(&(from, to))
}
