//! Claimed tasks, their outcomes and the handler contract

mod handle;
mod handler;
mod outcome;

pub use handle::{RetryState, TaskHandle};
pub use handler::{SharedHandler, TaskHandler};
pub use outcome::{Outcome, OutcomeKind};
