//! # External Task Worker Core
//!
//! Claims external tasks from a remote process engine, runs them through
//! user handlers under bounded concurrency and reports one of three outcomes:
//! success, retryable failure, or BPMN (business) error.
//!
//! ## Features
//!
//! - **Long-poll claiming**: one poll loop per subscribed topic, admission before claim
//! - **Bounded dispatch**: a single semaphore gate caps running handlers across topics
//! - **Write-once outcomes**: handlers return an [`Outcome`] or record it on the [`TaskHandle`]
//! - **Retry accounting**: engine retry counts are decremented, absent counts use a ceiling
//! - **Two-phase shutdown**: dispatches are cancelled and drained before the loops
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ExternalTaskWorker                        │
//! │  (subscribes topics, owns poll loops, two-phase stop)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PollLoop + Dispatcher                       │
//! │  (admission gate, claim batch, run handler, report)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   RemoteTaskGateway                          │
//! │  (HTTP client in extask-client, InMemoryGateway for tests)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use extask_core::prelude::*;
//!
//! let worker = ExternalTaskWorker::new(gateway, WorkerConfig::from_env())?;
//!
//! worker
//!     .run(Subscriptions::new().topic("validate-order", |task: TaskHandle| async move {
//!         match task.variable("amount") {
//!             Some(_) => Ok(task.complete(Variables::new(), Variables::new())),
//!             None => Ok(task.bpmn_error("MISSING_AMOUNT", None, Variables::new())),
//!         }
//!     }))
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod reliability;
pub mod task;
pub mod telemetry;
pub mod variables;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::WorkerConfig;
    pub use crate::error::{ConfigError, DispatchError, WorkerError};
    pub use crate::gateway::{
        Claim, ClaimRequest, FailureReport, GatewayError, InMemoryGateway, RemoteTaskGateway,
        TaskOffer,
    };
    pub use crate::reliability::BackoffPolicy;
    pub use crate::task::{Outcome, OutcomeKind, RetryState, TaskHandle, TaskHandler};
    pub use crate::variables::{ExtensionProperties, TypedValue, Variables};
    pub use crate::worker::{ExternalTaskWorker, Subscriptions, TopicSubscription, WorkerStatus};
}

pub use config::WorkerConfig;
pub use error::{ConfigError, DispatchError, WorkerError};
pub use gateway::{GatewayError, RemoteTaskGateway, TaskOffer};
pub use reliability::{Backoff, BackoffPolicy};
pub use task::{Outcome, OutcomeKind, TaskHandle, TaskHandler};
pub use variables::{ExtensionProperties, TypedValue, Variables};
pub use worker::{ExternalTaskWorker, Subscriptions, TopicSubscription, WorkerStatus};
