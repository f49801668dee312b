//! Single-task dispatch
//!
//! Runs one handler invocation for one [`TaskHandle`], turns whatever the
//! handler did into a terminal [`Outcome`] and reports it to the gateway.
//! Handler errors and panics become retryable failures, so the engine lease is
//! released even when handler code is defective.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use super::in_flight::InFlightTicket;
use crate::config::WorkerConfig;
use crate::error::DispatchError;
use crate::gateway::{FailureReport, GatewayError, RemoteTaskGateway};
use crate::task::{Outcome, TaskHandle, TaskHandler};

const HANDLER_FAILED: &str = "Task execution failed";
const NO_OUTCOME: &str = "Task handler produced no outcome";
const CANCELLED: &str = "Task execution cancelled";
const CANCELLED_DETAILS: &str = "Task was cancelled by the user or system";
const NOT_STARTED_DETAILS: &str = "Worker shut down before the task was started";

/// How the handler invocation ended
enum Invocation {
    Returned(Outcome),
    Failed(String),
    Cancelled,
}

/// Executes handlers and reports their outcomes
pub struct Dispatcher {
    gateway: Arc<dyn RemoteTaskGateway>,
    worker_id: String,
    default_retries: u32,
    default_retry_delay: Duration,
    report_timeout: Duration,
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn RemoteTaskGateway>, config: &WorkerConfig) -> Self {
        Self {
            gateway,
            worker_id: config.worker_id.clone(),
            default_retries: config.default_retries,
            default_retry_delay: config.default_retry_delay,
            report_timeout: config.report_timeout,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run `handler` for `task` and report the outcome
    ///
    /// Returns the reported outcome. Fails when the handler left no outcome,
    /// when the engine did not acknowledge the report, when the report call
    /// itself failed, or when the ticket's token fired before the handler
    /// finished. A shutdown cancellation still reports a cancellation failure
    /// on a best-effort basis; a superseded dispatch reports nothing, since the
    /// lease now belongs to the newer offer.
    ///
    /// When the handler both records an outcome on the handle and returns a
    /// different terminal one, the recorded outcome is reported.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(worker_id = %self.worker_id, topic = %task.topic_name(), task_id = %task.id())
    )]
    pub async fn dispatch(
        &self,
        task: TaskHandle,
        handler: &dyn TaskHandler,
        ticket: &InFlightTicket,
    ) -> Result<Outcome, DispatchError> {
        debug!(
            retries = ?task.retries(),
            variables = ?task.variables().redacted().to_plain(),
            "Executing task"
        );

        let invocation = {
            let run = AssertUnwindSafe(handler.handle(task.clone())).catch_unwind();
            tokio::select! {
                biased;
                _ = ticket.token.cancelled() => Invocation::Cancelled,
                result = run => match result {
                    Ok(Ok(outcome)) => Invocation::Returned(outcome),
                    Ok(Err(e)) => Invocation::Failed(format!("{e:#}")),
                    Err(panic) => Invocation::Failed(panic_message(panic.as_ref())),
                },
            }
        };

        match invocation {
            Invocation::Returned(returned) => {
                let outcome = if returned.is_terminal() {
                    let settled = task.settle(returned.clone());
                    if settled != returned {
                        warn!(
                            recorded = %settled.kind(),
                            returned = %returned.kind(),
                            "Handler returned an outcome different from the one it recorded, reporting the recorded one"
                        );
                    }
                    settled
                } else {
                    task.outcome()
                };

                if outcome.is_terminal() {
                    self.report(&task, &outcome).await?;
                    return Ok(outcome);
                }

                error!("Task handler returned without recording complete, failure or BPMN error");
                let fallback = task.settle(self.failure_for(&task, NO_OUTCOME, None));
                if let Err(e) = self.report(&task, &fallback).await {
                    error!(error = %e, "Failed to report fallback failure for task without outcome");
                }
                Err(DispatchError::UnsetOutcome {
                    task_id: task.id().to_string(),
                    topic: task.topic_name().to_string(),
                    worker_id: self.worker_id.clone(),
                })
            }
            Invocation::Failed(details) => {
                error!(error = %details, "Task handler failed");
                let outcome = task.settle(self.failure_for(&task, HANDLER_FAILED, Some(details)));
                self.report(&task, &outcome).await?;
                Ok(outcome)
            }
            Invocation::Cancelled if ticket.is_superseded() => {
                info!("Task offered again, dropping superseded dispatch without reporting");
                Err(DispatchError::Superseded {
                    task_id: task.id().to_string(),
                    topic: task.topic_name().to_string(),
                })
            }
            Invocation::Cancelled => {
                info!("Task execution cancelled, releasing lease");
                let outcome = task.settle(self.failure_for(
                    &task,
                    CANCELLED,
                    Some(CANCELLED_DETAILS.to_string()),
                ));
                if let Err(e) = self.report(&task, &outcome).await {
                    warn!(error = %e, "Could not report cancellation");
                }
                Err(DispatchError::Cancelled {
                    task_id: task.id().to_string(),
                    topic: task.topic_name().to_string(),
                })
            }
        }
    }

    /// Report a claimed task that will never be started
    ///
    /// Used for offers left over from a batch when shutdown begins, so their
    /// leases are released instead of running into expiry.
    #[instrument(
        skip_all,
        fields(worker_id = %self.worker_id, topic = %task.topic_name(), task_id = %task.id())
    )]
    pub async fn abandon(&self, task: TaskHandle) -> Result<(), DispatchError> {
        let outcome = task.settle(self.failure_for(
            &task,
            CANCELLED,
            Some(NOT_STARTED_DETAILS.to_string()),
        ));
        self.report(&task, &outcome).await
    }

    fn failure_for(&self, task: &TaskHandle, message: &str, details: Option<String>) -> Outcome {
        Outcome::retryable_failure(
            message,
            details,
            task.retry_state().after_failure(self.default_retries),
            self.default_retry_delay,
        )
    }

    async fn report(&self, task: &TaskHandle, outcome: &Outcome) -> Result<(), DispatchError> {
        let kind = outcome.kind();
        let task_id = task.id();

        let call = async {
            match outcome {
                Outcome::Success {
                    global_variables,
                    local_variables,
                } => {
                    debug!(
                        global_variables = ?global_variables.redacted().to_plain(),
                        local_variables = ?local_variables.redacted().to_plain(),
                        "Reporting completion"
                    );
                    self.gateway
                        .report_success(&self.worker_id, task_id, global_variables, local_variables)
                        .await
                }
                Outcome::RetryableFailure {
                    message,
                    details,
                    retries_remaining,
                    retry_delay,
                } => {
                    let report = FailureReport {
                        message: message.clone(),
                        details: details.clone(),
                        retries: *retries_remaining,
                        retry_delay: *retry_delay,
                    };
                    debug!(
                        message = %report.message,
                        retries = report.retries,
                        retry_delay_ms = report.retry_delay.as_millis() as u64,
                        "Reporting failure"
                    );
                    self.gateway
                        .report_failure(&self.worker_id, task_id, &report)
                        .await
                }
                Outcome::BusinessError {
                    code,
                    message,
                    variables,
                } => {
                    debug!(
                        code = %code,
                        variables = ?variables.redacted().to_plain(),
                        "Reporting BPMN error"
                    );
                    self.gateway
                        .report_business_error(
                            &self.worker_id,
                            task_id,
                            code,
                            message.as_deref(),
                            variables,
                        )
                        .await
                }
                Outcome::Unset => Ok(false),
            }
        };

        let result = tokio::time::timeout(self.report_timeout, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout(self.report_timeout)));

        match result {
            Ok(true) => {
                info!(outcome = %kind, "Marked task");
                Ok(())
            }
            Ok(false) => {
                let err = DispatchError::NotAcknowledged {
                    kind,
                    task_id: task_id.to_string(),
                    topic: task.topic_name().to_string(),
                    worker_id: self.worker_id.clone(),
                };
                error!(outcome = %kind, "{err}");
                Err(err)
            }
            Err(source) => {
                error!(outcome = %kind, error = %source, "Failed to report task outcome");
                Err(DispatchError::Report {
                    kind,
                    task_id: task_id.to_string(),
                    topic: task.topic_name().to_string(),
                    worker_id: self.worker_id.clone(),
                    source,
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ClaimRequest, InMemoryGateway, ReportRecord, TaskOffer};
    use crate::worker::in_flight::InFlightTasks;
    use tokio_util::sync::CancellationToken;
    use crate::variables::Variables;
    use async_trait::async_trait;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryGateway>, Dispatcher) {
        let gateway = Arc::new(InMemoryGateway::new());
        let config = WorkerConfig::new("worker-1")
            .with_default_retries(3)
            .with_default_retry_delay(Duration::from_secs(10));
        let dispatcher = Dispatcher::new(gateway.clone(), &config);
        (gateway, dispatcher)
    }

    fn ticket() -> InFlightTicket {
        InFlightTicket::detached("task-1", CancellationToken::new())
    }

    fn task(retries: Option<u32>) -> TaskHandle {
        TaskHandle::new(TaskOffer::new("task-1", "charge", "worker-1").with_retries(retries))
    }

    async fn complete_with_x(task: TaskHandle) -> anyhow::Result<Outcome> {
        Ok(task.complete(Variables::new().with("x", 1), Variables::new()))
    }

    async fn complete_empty(task: TaskHandle) -> anyhow::Result<Outcome> {
        Ok(task.complete(Variables::new(), Variables::new()))
    }

    async fn record_bpmn_error(task: TaskHandle) -> anyhow::Result<Outcome> {
        task.bpmn_error("INVALID", Some("bad card".into()), Variables::new());
        Ok(Outcome::Unset)
    }

    async fn failing(_task: TaskHandle) -> anyhow::Result<Outcome> {
        Err(anyhow::anyhow!("db down"))
    }

    async fn panicking(_task: TaskHandle) -> anyhow::Result<Outcome> {
        panic!("index out of bounds")
    }

    async fn forgetful(_task: TaskHandle) -> anyhow::Result<Outcome> {
        Ok(Outcome::Unset)
    }

    async fn sleepy(_task: TaskHandle) -> anyhow::Result<Outcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Outcome::Unset)
    }

    #[tokio::test]
    async fn test_returned_outcome_is_reported() {
        let (gateway, dispatcher) = setup();

        let outcome = dispatcher
            .dispatch(task(None), &complete_with_x, &ticket())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(
            gateway.reports(),
            vec![ReportRecord::Success {
                worker_id: "worker-1".into(),
                task_id: "task-1".into(),
                global_variables: json!({"x": {"value": 1}}),
                local_variables: json!({}),
            }]
        );
    }

    #[tokio::test]
    async fn test_outcome_read_from_slot() {
        let (gateway, dispatcher) = setup();

        let outcome = dispatcher
            .dispatch(task(None), &record_bpmn_error, &ticket())
            .await
            .unwrap();

        assert!(outcome.is_business_error());
        assert!(matches!(
            &gateway.reports()[0],
            ReportRecord::BusinessError { code, message: Some(m), .. } if code == "INVALID" && m == "bad card"
        ));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure() {
        let (gateway, dispatcher) = setup();

        let outcome = dispatcher
            .dispatch(task(Some(3)), &failing, &ticket())
            .await
            .unwrap();

        assert!(outcome.is_retryable_failure());
        match &gateway.reports()[0] {
            ReportRecord::Failure { report, .. } => {
                assert_eq!(report.message, HANDLER_FAILED);
                assert_eq!(report.details.as_deref(), Some("db down"));
                assert_eq!(report.retries, 2);
                assert_eq!(report.retry_delay, Duration::from_secs(10));
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failure() {
        let (gateway, dispatcher) = setup();

        let outcome = dispatcher
            .dispatch(task(None), &panicking, &ticket())
            .await
            .unwrap();

        assert!(outcome.is_retryable_failure());
        match &gateway.reports()[0] {
            ReportRecord::Failure { report, .. } => {
                assert_eq!(report.retries, 3);
                assert!(report
                    .details
                    .as_deref()
                    .is_some_and(|d| d.contains("index out of bounds")));
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unset_outcome_is_fatal_but_releases_lease() {
        let (gateway, dispatcher) = setup();

        let err = dispatcher
            .dispatch(task(None), &forgetful, &ticket())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::UnsetOutcome { .. }));
        assert!(matches!(
            &gateway.reports()[0],
            ReportRecord::Failure { report, .. } if report.message == NO_OUTCOME
        ));
    }

    #[tokio::test]
    async fn test_rejected_report_is_lease_race() {
        let (gateway, dispatcher) = setup();
        gateway.set_acknowledge_reports(false);

        let err = dispatcher
            .dispatch(task(None), &complete_empty, &ticket())
            .await
            .unwrap_err();

        assert!(err.is_lease_race());
        let message = err.to_string();
        assert!(message.contains("task_id=task-1"));
        assert!(message.contains("topic=charge"));
        assert!(message.contains("worker_id=worker-1"));
    }

    #[tokio::test]
    async fn test_report_transport_error() {
        let (gateway, dispatcher) = setup();
        gateway.fail_reports_with(GatewayError::Transport("connection reset".into()));

        let err = dispatcher
            .dispatch(task(None), &complete_empty, &ticket())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Report {
                source: GatewayError::Transport(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reports_failure() {
        let (gateway, dispatcher) = setup();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .dispatch(task(Some(1)), &sleepy, &InFlightTicket::detached("task-1", cancel))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        match &gateway.reports()[0] {
            ReportRecord::Failure { report, .. } => {
                assert_eq!(report.message, CANCELLED);
                assert_eq!(report.details.as_deref(), Some(CANCELLED_DETAILS));
                assert_eq!(report.retries, 0);
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_dispatch_does_not_report() {
        let (gateway, dispatcher) = setup();
        let registry = InFlightTasks::new(CancellationToken::new());
        let first = registry.register("task-1", "charge");

        let running = dispatcher.dispatch(task(Some(2)), &sleepy, &first);
        let reoffer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.register("task-1", "charge")
        };
        let (result, second) = tokio::join!(running, reoffer);

        assert!(matches!(result, Err(DispatchError::Superseded { .. })));
        assert!(result.unwrap_err().is_cancelled());
        assert!(gateway.reports().is_empty());
        assert!(!second.token.is_cancelled());
        assert!(registry.contains("task-1"));
    }

    async fn record_then_return_other(task: TaskHandle) -> anyhow::Result<Outcome> {
        task.bpmn_error("INVALID", None, Variables::new());
        Ok(Outcome::success(Variables::new().with("x", 1), Variables::new()))
    }

    #[tokio::test]
    async fn test_recorded_outcome_wins_over_returned() {
        let (gateway, dispatcher) = setup();

        let outcome = dispatcher
            .dispatch(task(None), &record_then_return_other, &ticket())
            .await
            .unwrap();

        assert!(outcome.is_business_error());
        assert_eq!(gateway.reports().len(), 1);
        assert!(matches!(
            &gateway.reports()[0],
            ReportRecord::BusinessError { code, .. } if code == "INVALID"
        ));
    }

    #[tokio::test]
    async fn test_abandon_reports_cancelled_failure() {
        let (gateway, dispatcher) = setup();
        dispatcher.abandon(task(None)).await.unwrap();
        assert!(matches!(
            &gateway.reports()[0],
            ReportRecord::Failure { report, .. }
                if report.message == CANCELLED
                    && report.details.as_deref() == Some(NOT_STARTED_DETAILS)
        ));
    }

    struct StalledGateway;

    #[async_trait]
    impl RemoteTaskGateway for StalledGateway {
        async fn claim_batch(&self, _: &ClaimRequest) -> Result<Vec<TaskOffer>, GatewayError> {
            Ok(vec![])
        }

        async fn report_success(
            &self,
            _: &str,
            _: &str,
            _: &Variables,
            _: &Variables,
        ) -> Result<bool, GatewayError> {
            std::future::pending().await
        }

        async fn report_failure(
            &self,
            _: &str,
            _: &str,
            _: &FailureReport,
        ) -> Result<bool, GatewayError> {
            std::future::pending().await
        }

        async fn report_business_error(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: &Variables,
        ) -> Result<bool, GatewayError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_times_out() {
        let config = WorkerConfig::new("worker-1").with_report_timeout(Duration::from_secs(2));
        let dispatcher = Dispatcher::new(Arc::new(StalledGateway), &config);

        let err = dispatcher
            .dispatch(task(None), &complete_empty, &ticket())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Report {
                source: GatewayError::Timeout(_),
                ..
            }
        ));
    }
}
