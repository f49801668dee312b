//! Handler contract for topic subscriptions

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Outcome, TaskHandle};

/// User logic invoked once per claimed task
///
/// Return the outcome directly, or record it on the handle and return
/// [`Outcome::Unset`]. An `Err` (or a panic) is treated as a handler defect and
/// reported as a retryable failure.
///
/// Plain async closures implement this trait:
///
/// ```ignore
/// let handler = |task: TaskHandle| async move {
///     let amount = task.variable("amount");
///     Ok(task.complete(Variables::new().with("approved", true), Variables::new()))
/// };
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: TaskHandle) -> anyhow::Result<Outcome>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    async fn handle(&self, task: TaskHandle) -> anyhow::Result<Outcome> {
        (self)(task).await
    }
}

/// Handler shared between a poll loop and its dispatches
pub type SharedHandler = Arc<dyn TaskHandler>;
