//! Per-topic poll loop
//!
//! Each iteration admits one slot before claiming, so the worker never leases
//! more tasks than it can start. The claimed batch fans out into concurrent
//! dispatches tracked by the worker's [`TaskTracker`]; the loop itself goes
//! straight back to claiming.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::admission::{AdmissionGate, AdmissionPermit};
use super::dispatcher::Dispatcher;
use super::in_flight::InFlightTasks;
use super::subscription::TopicSubscription;
use crate::config::WorkerConfig;
use crate::error::DispatchError;
use crate::gateway::{Claim, ClaimRequest, GatewayError, RemoteTaskGateway, TaskOffer};
use crate::reliability::Backoff;
use crate::task::{SharedHandler, TaskHandle};

/// Resources shared by every poll loop of one worker
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub config: Arc<WorkerConfig>,
    pub gateway: Arc<dyn RemoteTaskGateway>,
    pub dispatcher: Arc<Dispatcher>,
    pub gate: AdmissionGate,
    pub in_flight: Arc<InFlightTasks>,
    pub tracker: TaskTracker,
    /// Cancelled in the first shutdown phase; parent of every dispatch token
    pub dispatch_scope: CancellationToken,
    /// Bounded; errors are dropped (after logging) when nobody drains it
    pub errors: mpsc::Sender<DispatchError>,
}

/// Claim loop for one topic
pub(crate) struct PollLoop {
    ctx: LoopContext,
    subscription: TopicSubscription,
    handler: SharedHandler,
}

impl PollLoop {
    pub fn new(ctx: LoopContext, subscription: TopicSubscription, handler: SharedHandler) -> Self {
        Self {
            ctx,
            subscription,
            handler,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Gateway errors never end the loop; they are logged and followed by a
    /// backoff sleep.
    #[instrument(
        name = "poll_loop",
        skip_all,
        fields(worker_id = %self.ctx.config.worker_id, topic = %self.subscription.topic_name())
    )]
    pub async fn run(self, shutdown: CancellationToken) {
        let request = self.subscription.to_request(&self.ctx.config);
        let mut backoff = Backoff::new(self.ctx.config.error_backoff.clone());

        info!(
            lease_ms = request.topics[0].lock_duration.as_millis() as u64,
            max_tasks = request.max_tasks,
            "Poll loop started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.ctx.dispatch_scope.cancelled() => {
                    shutdown.cancelled().await;
                    break;
                }
                permit = self.ctx.gate.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        shutdown.cancelled().await;
                        break;
                    }
                },
            };

            // A claim in flight when draining starts is awaited, so tasks the
            // engine already leased reach dispatch_batch and get abandoned
            let claim = tokio::select! {
                biased;
                claim = self.claim(&request) => claim,
                _ = shutdown.cancelled() => break,
            };

            match claim {
                Ok(Claim::Empty) => {
                    backoff.reset();
                    drop(permit);
                    debug!("No tasks available");
                    if sleep_or_shutdown(self.ctx.config.idle_sleep, &shutdown).await {
                        break;
                    }
                }
                Ok(Claim::Tasks(offers)) => {
                    backoff.reset();
                    debug!(count = offers.len(), "Claimed tasks");
                    self.dispatch_batch(offers, permit).await;
                }
                Err(e) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    if e.is_transient() {
                        warn!(
                            error = %e,
                            consecutive_failures = backoff.consecutive_failures(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Claim failed, backing off"
                        );
                    } else {
                        error!(
                            error = %e,
                            status = ?e.status(),
                            error_type = ?e.error_type(),
                            consecutive_failures = backoff.consecutive_failures(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Claim rejected by engine, backing off"
                        );
                    }
                    if sleep_or_shutdown(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Poll loop stopped");
    }

    /// Claim with a client deadline beyond the server's long-poll window
    async fn claim(&self, request: &ClaimRequest) -> Result<Claim, GatewayError> {
        let deadline = self.ctx.config.claim_timeout();
        tokio::time::timeout(deadline, self.ctx.gateway.claim_batch(request))
            .await
            .unwrap_or(Err(GatewayError::Timeout(deadline)))
            .map(Claim::from)
    }

    /// Start one dispatch per offer; the first reuses the claim's permit
    async fn dispatch_batch(&self, offers: Vec<TaskOffer>, first: AdmissionPermit) {
        let mut permit = Some(first);
        let mut offers = offers.into_iter();

        while let Some(offer) = offers.next() {
            let admitted = match permit.take() {
                Some(permit) if !self.ctx.dispatch_scope.is_cancelled() => Some(permit),
                Some(_) => None,
                None => self.admit_next().await,
            };

            match admitted {
                Some(permit) => self.spawn_dispatch(offer, permit),
                None => {
                    let unstarted: Vec<_> = std::iter::once(offer).chain(offers).collect();
                    self.abandon(unstarted);
                    return;
                }
            }
        }
    }

    async fn admit_next(&self) -> Option<AdmissionPermit> {
        tokio::select! {
            biased;
            _ = self.ctx.dispatch_scope.cancelled() => None,
            permit = self.ctx.gate.acquire() => permit.ok(),
        }
    }

    fn spawn_dispatch(&self, offer: TaskOffer, permit: AdmissionPermit) {
        let task = TaskHandle::new(offer);
        let ticket = self.ctx.in_flight.register(task.id(), task.topic_name());
        let dispatcher = Arc::clone(&self.ctx.dispatcher);
        let handler = Arc::clone(&self.handler);
        let in_flight = Arc::clone(&self.ctx.in_flight);
        let errors = self.ctx.errors.clone();

        self.ctx.tracker.spawn(async move {
            let _permit = permit;
            let result = dispatcher
                .dispatch(task, handler.as_ref(), &ticket)
                .await;
            in_flight.complete(&ticket);

            match result {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {
                    debug!(task_id = %e.task_id(), "Dispatch cancelled");
                }
                Err(e) => forward_error(&errors, e),
            }
        });
    }

    /// Release leases of offers that will not be started
    fn abandon(&self, offers: Vec<TaskOffer>) {
        warn!(
            count = offers.len(),
            "Shutdown started before the batch was admitted, releasing unstarted tasks"
        );
        let dispatcher = Arc::clone(&self.ctx.dispatcher);
        self.ctx.tracker.spawn(async move {
            for offer in offers {
                let task = TaskHandle::new(offer);
                if let Err(e) = dispatcher.abandon(task).await {
                    debug!(error = %e, "Could not release unstarted task");
                }
            }
        });
    }
}

/// Hand a fatal dispatch error to the supervision channel without blocking
fn forward_error(errors: &mpsc::Sender<DispatchError>, error: DispatchError) {
    match errors.try_send(error) {
        Ok(()) => {}
        Err(TrySendError::Full(error)) => {
            warn!(task_id = %error.task_id(), error = %error, "Dispatch error channel full, dropping error");
        }
        // Nobody supervises; the error has been logged where it occurred
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Sleep unless shutdown arrives first; true when shutting down
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryGateway, ReportRecord};
    use crate::task::Outcome;
    use crate::variables::Variables;
    use tokio::time::Instant;

    async fn complete(task: TaskHandle) -> anyhow::Result<Outcome> {
        Ok(task.complete(Variables::new(), Variables::new()))
    }

    struct Harness {
        gateway: Arc<InMemoryGateway>,
        ctx: LoopContext,
        errors: mpsc::Receiver<DispatchError>,
        shutdown: CancellationToken,
    }

    fn harness(config: WorkerConfig) -> Harness {
        let gateway = Arc::new(InMemoryGateway::new());
        let config = Arc::new(config);
        let dispatch_scope = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let ctx = LoopContext {
            dispatcher: Arc::new(Dispatcher::new(gateway.clone(), &config)),
            gateway: gateway.clone(),
            gate: AdmissionGate::new(config.max_in_flight),
            in_flight: Arc::new(InFlightTasks::new(dispatch_scope.clone())),
            tracker: TaskTracker::new(),
            dispatch_scope,
            errors: tx,
            config,
        };
        Harness {
            gateway,
            ctx,
            errors: rx,
            shutdown: CancellationToken::new(),
        }
    }

    fn spawn_loop(h: &Harness, topic: &str) -> tokio::task::JoinHandle<()> {
        let poll = PollLoop::new(h.ctx.clone(), TopicSubscription::new(topic), Arc::new(complete));
        tokio::spawn(poll.run(h.shutdown.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_and_dispatches() {
        let h = harness(WorkerConfig::new("w-1"));
        h.gateway.push_offer(TaskOffer::new("t-1", "charge", ""));
        let handle = spawn_loop(&h, "charge");

        let reports = h
            .gateway
            .wait_for_reports(1, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(&reports[0], ReportRecord::Success { task_id, worker_id, .. } if task_id == "t-1" && worker_id == "w-1"));

        h.shutdown.cancel();
        handle.await.unwrap();
        h.ctx.tracker.close();
        h.ctx.tracker.wait().await;
        assert_eq!(h.ctx.gate.available(), h.ctx.config.max_in_flight);
        assert!(h.ctx.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_errors_back_off_and_recover() {
        let h = harness(WorkerConfig::new("w-1").with_idle_sleep(Duration::from_millis(500)));
        h.gateway
            .script_claim(Err(GatewayError::Transport("connection refused".into())));
        h.gateway
            .script_claim(Err(GatewayError::remote(500, None, Some("boom".into()))));
        h.gateway.push_offer(TaskOffer::new("t-1", "charge", ""));
        let handle = spawn_loop(&h, "charge");

        h.gateway
            .wait_for_reports(1, Duration::from_secs(10))
            .await
            .unwrap();

        let times = h.gateway.claim_times();
        assert!(times.len() >= 3);
        assert!(times[1] - times[0] >= Duration::from_millis(500));
        assert!(times[2] - times[1] >= Duration::from_millis(500));

        h.shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_deadline_exceeds_long_poll() {
        let config = WorkerConfig::new("w-1")
            .with_long_poll_timeout(Duration::from_secs(5))
            .with_network_margin(Duration::from_secs(1));
        let h = harness(config);
        let started = Instant::now();
        let handle = spawn_loop(&h, "charge");

        // An empty long poll is answered by the engine, never timed out locally
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(h.gateway.claim_count(), 2);
        assert!(h.gateway.claim_times()[1] - started >= Duration::from_secs(6));

        h.shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_abandoned_when_draining() {
        let mut h = harness(WorkerConfig::new("w-1").with_max_in_flight(2).with_max_tasks(2));
        let held = h.ctx.gate.acquire().await.unwrap();
        h.ctx.dispatch_scope.cancel();

        let poll = PollLoop::new(h.ctx.clone(), TopicSubscription::new("charge"), Arc::new(complete));
        let first = h.ctx.gate.acquire().await.unwrap();
        poll.dispatch_batch(
            vec![
                TaskOffer::new("t-1", "charge", "w-1"),
                TaskOffer::new("t-2", "charge", "w-1"),
            ],
            first,
        )
        .await;

        h.ctx.tracker.close();
        h.ctx.tracker.wait().await;
        drop(held);

        let reports = h.gateway.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| matches!(r, ReportRecord::Failure { .. })));
        assert!(h.errors.try_recv().is_err());
        assert_eq!(h.ctx.gate.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_answered_while_draining_is_abandoned() {
        let mut h = harness(WorkerConfig::new("w-1").with_long_poll_timeout(Duration::from_secs(30)));
        let handle = spawn_loop(&h, "charge");

        // The long poll is parked on the engine when draining begins
        while h.gateway.claim_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.ctx.dispatch_scope.cancel();
        h.gateway.push_offer(TaskOffer::new("t-1", "charge", ""));

        let reports = h
            .gateway
            .wait_for_reports(1, Duration::from_secs(10))
            .await
            .unwrap();
        match &reports[0] {
            ReportRecord::Failure { task_id, report, .. } => {
                assert_eq!(task_id, "t-1");
                assert_eq!(report.message, "Task execution cancelled");
            }
            other => panic!("unexpected report: {other:?}"),
        }

        h.shutdown.cancel();
        handle.await.unwrap();
        h.ctx.tracker.close();
        h.ctx.tracker.wait().await;
        assert_eq!(h.gateway.claim_count(), 1);
        assert!(h.ctx.in_flight.is_empty());
        assert!(h.errors.try_recv().is_err());
    }

    fn lease_race(task_id: &str) -> DispatchError {
        DispatchError::NotAcknowledged {
            kind: crate::task::OutcomeKind::Success,
            task_id: task_id.into(),
            topic: "charge".into(),
            worker_id: "w-1".into(),
        }
    }

    #[test]
    fn test_forward_error_drops_when_full_or_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        forward_error(&tx, lease_race("t-1"));
        forward_error(&tx, lease_race("t-2"));

        assert_eq!(rx.try_recv().unwrap().task_id(), "t-1");
        assert!(rx.try_recv().is_err());

        drop(rx);
        forward_error(&tx, lease_race("t-3"));
    }
}
