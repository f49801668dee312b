//! In-memory implementation of RemoteTaskGateway for testing
//!
//! Behaves like a minimal engine: offers pushed with [`InMemoryGateway::push_offer`]
//! are leased to matching claims, claims long-poll until work arrives or the
//! requested window expires, and every report is recorded for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ClaimRequest, FailureReport, GatewayError, RemoteTaskGateway, TaskOffer};
use crate::variables::Variables;

/// One report received by the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum ReportRecord {
    Success {
        worker_id: String,
        task_id: String,
        global_variables: Value,
        local_variables: Value,
    },
    Failure {
        worker_id: String,
        task_id: String,
        report: FailureReport,
    },
    BusinessError {
        worker_id: String,
        task_id: String,
        code: String,
        message: Option<String>,
        variables: Value,
    },
}

impl ReportRecord {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Success { task_id, .. }
            | Self::Failure { task_id, .. }
            | Self::BusinessError { task_id, .. } => task_id,
        }
    }
}

/// In-memory gateway
///
/// # Example
///
/// ```
/// use extask_core::gateway::{InMemoryGateway, TaskOffer};
///
/// let gateway = InMemoryGateway::new();
/// gateway.push_offer(TaskOffer::new("task-1", "charge-card", ""));
/// assert_eq!(gateway.pending_count(), 1);
/// ```
pub struct InMemoryGateway {
    pending: Mutex<VecDeque<TaskOffer>>,
    scripted_claims: Mutex<VecDeque<Result<Vec<TaskOffer>, GatewayError>>>,
    claims: Mutex<Vec<(Instant, ClaimRequest)>>,
    reports: Mutex<Vec<ReportRecord>>,
    report_error: Mutex<Option<GatewayError>>,
    acknowledge: AtomicBool,
    offered: Notify,
    reported: Notify,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            scripted_claims: Mutex::new(VecDeque::new()),
            claims: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            report_error: Mutex::new(None),
            acknowledge: AtomicBool::new(true),
            offered: Notify::new(),
            reported: Notify::new(),
        }
    }

    /// Make an offer available to the next matching claim
    pub fn push_offer(&self, offer: TaskOffer) {
        self.pending.lock().push_back(offer);
        self.offered.notify_waiters();
    }

    /// Answer the next claim with `response` immediately, bypassing the queue
    pub fn script_claim(&self, response: Result<Vec<TaskOffer>, GatewayError>) {
        self.scripted_claims.lock().push_back(response);
    }

    /// Whether report calls are acknowledged (`true`) or rejected (`false`)
    pub fn set_acknowledge_reports(&self, acknowledge: bool) {
        self.acknowledge.store(acknowledge, Ordering::SeqCst);
    }

    /// Fail every subsequent report call with `error`
    pub fn fail_reports_with(&self, error: GatewayError) {
        *self.report_error.lock() = Some(error);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn claim_count(&self) -> usize {
        self.claims.lock().len()
    }

    /// Time at which each claim call arrived
    pub fn claim_times(&self) -> Vec<Instant> {
        self.claims.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn claim_requests(&self) -> Vec<ClaimRequest> {
        self.claims.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn reports(&self) -> Vec<ReportRecord> {
        self.reports.lock().clone()
    }

    /// Wait until at least `count` reports were received
    ///
    /// Returns the reports, or `None` if `timeout` elapsed first.
    pub async fn wait_for_reports(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<ReportRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.reported.notified();
            {
                let reports = self.reports.lock();
                if reports.len() >= count {
                    return Some(reports.clone());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn take_matching(&self, request: &ClaimRequest) -> Vec<TaskOffer> {
        let topics = request.topic_names();
        let mut pending = self.pending.lock();
        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(pending.len());

        while let Some(offer) = pending.pop_front() {
            if taken.len() < request.max_tasks && topics.contains(&offer.topic_name.as_str()) {
                taken.push(TaskOffer {
                    worker_id: request.worker_id.clone(),
                    ..offer
                });
            } else {
                remaining.push_back(offer);
            }
        }
        *pending = remaining;
        taken
    }

    fn record(&self, report: ReportRecord) -> Result<bool, GatewayError> {
        if let Some(error) = self.report_error.lock().clone() {
            return Err(error);
        }
        self.reports.lock().push(report);
        self.reported.notify_waiters();
        Ok(self.acknowledge.load(Ordering::SeqCst))
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn to_json(variables: &Variables) -> Value {
    serde_json::to_value(variables).unwrap_or(Value::Null)
}

#[async_trait]
impl RemoteTaskGateway for InMemoryGateway {
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<TaskOffer>, GatewayError> {
        self.claims.lock().push((Instant::now(), request.clone()));

        if let Some(scripted) = self.scripted_claims.lock().pop_front() {
            return scripted;
        }

        let deadline = Instant::now() + request.long_poll_timeout;
        loop {
            let notified = self.offered.notified();
            let taken = self.take_matching(request);
            if !taken.is_empty() {
                return Ok(taken);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn report_success(
        &self,
        worker_id: &str,
        task_id: &str,
        global_variables: &Variables,
        local_variables: &Variables,
    ) -> Result<bool, GatewayError> {
        self.record(ReportRecord::Success {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            global_variables: to_json(global_variables),
            local_variables: to_json(local_variables),
        })
    }

    async fn report_failure(
        &self,
        worker_id: &str,
        task_id: &str,
        report: &FailureReport,
    ) -> Result<bool, GatewayError> {
        self.record(ReportRecord::Failure {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            report: report.clone(),
        })
    }

    async fn report_business_error(
        &self,
        worker_id: &str,
        task_id: &str,
        code: &str,
        message: Option<&str>,
        variables: &Variables,
    ) -> Result<bool, GatewayError> {
        self.record(ReportRecord::BusinessError {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            code: code.to_string(),
            message: message.map(str::to_string),
            variables: to_json(variables),
        })
    }
}
