//! Reliability primitives
//!
//! - [`BackoffPolicy`] - Fixed or exponential delay after claim errors
//! - [`Backoff`] - Consecutive-failure tracker used by the poll loop

mod backoff;

pub use backoff::{Backoff, BackoffPolicy};
