//! Cooperative cancellation and bounded execution.
//!
//! - [`CancellationToken`] for shutdown signalling
//! - [`FinalizeGuard`] for cleanup that must run on every exit path
//! - [`run_with_timeout`] for bounding a single operation
//! - [`catch_panic`] so a panicking task still yields an error value

mod bounded;
mod guard;
mod token;

pub use bounded::{catch_panic, run_with_timeout};
pub use guard::FinalizeGuard;
pub use token::CancellationToken;
