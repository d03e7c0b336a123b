//! Scheduled-run state machine.
//!
//! `SCHEDULED -> PENDING -> RUNNING -> COMPLETED | FAILED`, with
//! `RUNNING -> PENDING` for bounded retries. Transitions are conditional
//! writes against a [`StateStore`]; no in-process lock is relied upon.

mod manager;
mod memory;
mod store;
pub mod transitions;

pub use manager::PipelineStateManager;
pub use memory::MemoryStateStore;
pub use store::{CasResult, StateStore, TransitionPatch};
pub use transitions::{is_valid_transition, valid_targets, VALID_TRANSITIONS};
