//! Remote task gateway
//!
//! The gateway is the only path to the remote engine. It performs four
//! operations: claim a batch of tasks, and mark a task as succeeded, failed
//! (retryable) or raised a BPMN error. The mark operations answer `Ok(false)`
//! when the engine did not accept the report (typically the lease expired or
//! the task was completed elsewhere); they fail with [`GatewayError`] only
//! when the call itself could not complete.
//!
//! Implementations must be safe for concurrent use; the worker calls them from
//! every poll loop and dispatch without external locking.

mod error;
mod memory;
mod types;

use async_trait::async_trait;

pub use error::GatewayError;
pub use memory::{InMemoryGateway, ReportRecord};
pub use types::{Claim, ClaimRequest, FailureReport, TaskOffer, TopicRequest};

use crate::variables::Variables;

/// Operations the worker needs from the remote engine
#[async_trait]
pub trait RemoteTaskGateway: Send + Sync {
    /// Long-poll for up to `request.max_tasks` tasks and lease them
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<TaskOffer>, GatewayError>;

    /// Mark a task completed
    async fn report_success(
        &self,
        worker_id: &str,
        task_id: &str,
        global_variables: &Variables,
        local_variables: &Variables,
    ) -> Result<bool, GatewayError>;

    /// Mark a task failed; the engine retries while `report.retries > 0`
    async fn report_failure(
        &self,
        worker_id: &str,
        task_id: &str,
        report: &FailureReport,
    ) -> Result<bool, GatewayError>;

    /// Raise a BPMN error for the task
    async fn report_business_error(
        &self,
        worker_id: &str,
        task_id: &str,
        code: &str,
        message: Option<&str>,
        variables: &Variables,
    ) -> Result<bool, GatewayError>;
}
