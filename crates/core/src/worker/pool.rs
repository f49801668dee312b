//! External task worker lifecycle
//!
//! Owns the poll loops and every dispatch they start, and shuts both down in
//! two phases: dispatches first, loops second.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::admission::AdmissionGate;
use super::dispatcher::Dispatcher;
use super::in_flight::InFlightTasks;
use super::poller::{LoopContext, PollLoop};
use super::subscription::Subscriptions;
use crate::config::WorkerConfig;
use crate::error::{ConfigError, DispatchError, WorkerError};
use crate::gateway::RemoteTaskGateway;

/// Fatal dispatch errors buffered until the receiver drains them; later ones
/// are logged and dropped
pub const DISPATCH_ERROR_CAPACITY: usize = 256;

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Created, no topics subscribed yet
    Idle,
    /// Poll loops running
    Running,
    /// `stop` in progress
    Draining,
    /// Fully stopped; cannot be restarted
    Stopped,
}

/// Polling worker for one set of topic subscriptions
///
/// One poll loop runs per subscribed topic; all of them share a single
/// admission gate of `max_in_flight` slots.
pub struct ExternalTaskWorker {
    config: Arc<WorkerConfig>,
    gateway: Arc<dyn RemoteTaskGateway>,
    dispatcher: Arc<Dispatcher>,
    gate: AdmissionGate,
    in_flight: Arc<InFlightTasks>,
    tracker: TaskTracker,
    dispatch_scope: CancellationToken,
    loops_scope: CancellationToken,
    status: watch::Sender<WorkerStatus>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    errors_tx: mpsc::Sender<DispatchError>,
    errors_rx: Mutex<Option<mpsc::Receiver<DispatchError>>>,
}

impl ExternalTaskWorker {
    /// Create a worker; nothing runs until [`subscribe`](Self::subscribe)
    pub fn new(
        gateway: Arc<dyn RemoteTaskGateway>,
        config: WorkerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let config = Arc::new(config);
        let dispatch_scope = CancellationToken::new();
        let (errors_tx, errors_rx) = mpsc::channel(DISPATCH_ERROR_CAPACITY);
        let (status, _) = watch::channel(WorkerStatus::Idle);

        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(Arc::clone(&gateway), &config)),
            gate: AdmissionGate::new(config.max_in_flight),
            in_flight: Arc::new(InFlightTasks::new(dispatch_scope.clone())),
            tracker: TaskTracker::new(),
            dispatch_scope,
            loops_scope: CancellationToken::new(),
            status,
            loops: Mutex::new(Vec::new()),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            gateway,
            config,
        })
    }

    /// Start one poll loop per subscribed topic and return immediately
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, subscriptions: Subscriptions) -> Result<(), WorkerError> {
        subscriptions.validate()?;

        let mut claimed = false;
        self.status.send_if_modified(|status| {
            if *status == WorkerStatus::Idle {
                *status = WorkerStatus::Running;
                claimed = true;
                true
            } else {
                false
            }
        });
        if !claimed {
            return match self.status() {
                WorkerStatus::Running => Err(WorkerError::AlreadyRunning),
                _ => Err(WorkerError::Stopped),
            };
        }

        info!(
            worker_id = %self.config.worker_id,
            topics = ?subscriptions.topic_names(),
            max_in_flight = self.config.max_in_flight,
            "Starting external task worker"
        );

        let ctx = LoopContext {
            config: Arc::clone(&self.config),
            gateway: Arc::clone(&self.gateway),
            dispatcher: Arc::clone(&self.dispatcher),
            gate: self.gate.clone(),
            in_flight: Arc::clone(&self.in_flight),
            tracker: self.tracker.clone(),
            dispatch_scope: self.dispatch_scope.clone(),
            errors: self.errors_tx.clone(),
        };

        let mut loops = self.loops.lock();
        for (subscription, handler) in subscriptions.into_entries() {
            let poll = PollLoop::new(ctx.clone(), subscription, handler);
            loops.push(tokio::spawn(poll.run(self.loops_scope.clone())));
        }

        Ok(())
    }

    /// Subscribe and wait until the worker has been stopped
    pub async fn run(&self, subscriptions: Subscriptions) -> Result<(), WorkerError> {
        self.subscribe(subscriptions)?;
        self.stopped().await;
        Ok(())
    }

    /// Two-phase graceful shutdown
    ///
    /// Cancels all in-flight dispatches and waits for them (each still reports
    /// a cancellation failure), then cancels the poll loops and joins them.
    /// Returns [`WorkerError::ShutdownTimeout`] when dispatches did not drain
    /// within `shutdown_timeout`; the worker is stopped either way.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let mut previous = WorkerStatus::Stopped;
        self.status.send_if_modified(|status| {
            previous = *status;
            match *status {
                WorkerStatus::Idle | WorkerStatus::Running => {
                    *status = WorkerStatus::Draining;
                    true
                }
                _ => false,
            }
        });

        match previous {
            WorkerStatus::Stopped => return Ok(()),
            WorkerStatus::Draining => {
                self.stopped().await;
                return Ok(());
            }
            WorkerStatus::Idle | WorkerStatus::Running => {}
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        info!(
            in_flight = self.in_flight.len(),
            "Stopping worker, cancelling in-flight dispatches"
        );

        // Phase 1: dispatches
        self.dispatch_scope.cancel();
        self.tracker.close();
        if tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                "Dispatches still running at shutdown timeout"
            );
        } else {
            debug!("All dispatches finished");
        }

        // Phase 2: poll loops
        self.loops_scope.cancel();
        self.gate.close();
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Poll loop terminated abnormally");
            }
        }

        // Loops may have released unstarted offers while exiting
        let drained = tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_ok();
        let remaining = self.tracker.len();

        self.status.send_replace(WorkerStatus::Stopped);

        if drained {
            info!("Worker stopped");
            Ok(())
        } else {
            warn!(remaining, "Worker stopped with dispatches still running");
            Err(WorkerError::ShutdownTimeout { remaining })
        }
    }

    /// Wait until the worker has stopped
    pub async fn stopped(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|s| *s == WorkerStatus::Stopped).await;
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    /// Number of dispatches currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Admission slots currently free
    pub fn available_slots(&self) -> usize {
        self.gate.available()
    }

    /// Receiver of fatal dispatch errors; available once
    ///
    /// Lease races, outcome-less handlers and failed reports arrive here after
    /// being logged. Cancelled and superseded dispatches are not forwarded.
    /// At most [`DISPATCH_ERROR_CAPACITY`] errors are buffered whether or not
    /// the receiver is taken.
    pub fn take_dispatch_errors(&self) -> Option<mpsc::Receiver<DispatchError>> {
        self.errors_rx.lock().take()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

impl std::fmt::Debug for ExternalTaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalTaskWorker")
            .field("worker_id", &self.config.worker_id)
            .field("status", &self.status())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
