//! Task acquisition and concurrent dispatch
//!
//! This module provides:
//! - [`ExternalTaskWorker`] - Lifecycle controller owning the poll loops
//! - [`Subscriptions`] / [`TopicSubscription`] - Topics, claim filters and handlers
//! - [`Dispatcher`] - Runs one handler and reports its outcome
//! - [`AdmissionGate`] - Bounds concurrent dispatches across all topics
//! - [`InFlightTasks`] - Running dispatches by task id
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     ExternalTaskWorker                         │
//! │  ┌──────────────┐  ┌──────────────┐       ┌──────────────┐    │
//! │  │ PollLoop "A" │  │ PollLoop "B" │  ...  │ PollLoop "N" │    │
//! │  └──────┬───────┘  └──────┬───────┘       └──────┬───────┘    │
//! │         │  acquire slot, then claim_batch        │            │
//! │         ▼                 ▼                      ▼            │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │          AdmissionGate (max_in_flight permits)          │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! │         │  one dispatch per claimed task                      │
//! │         ▼                                                     │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │   TaskTracker: [Dispatch 1] [Dispatch 2] ... [Dispatch M]│  │
//! │  │   handler -> Outcome -> report_* via RemoteTaskGateway   │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown runs in two phases: the dispatch scope is cancelled and drained
//! first, then the poll loops are cancelled and joined.
//!
//! # Example
//!
//! ```ignore
//! use extask_core::prelude::*;
//!
//! let worker = ExternalTaskWorker::new(gateway, WorkerConfig::new("billing-1"))?;
//!
//! worker.subscribe(Subscriptions::new().topic("charge-card", |task: TaskHandle| async move {
//!     let amount = task.variable("amount");
//!     Ok(task.complete(Variables::new().with("charged", true), Variables::new()))
//! }))?;
//!
//! // Graceful shutdown
//! worker.stop().await?;
//! ```

mod admission;
mod dispatcher;
mod in_flight;
mod poller;
mod pool;
mod subscription;

pub use admission::{AdmissionError, AdmissionGate, AdmissionPermit};
pub use dispatcher::Dispatcher;
pub use in_flight::{InFlightTasks, InFlightTicket};
pub use pool::{ExternalTaskWorker, WorkerStatus, DISPATCH_ERROR_CAPACITY};
pub use subscription::{Subscriptions, TopicSubscription};
