//! Error types of the worker core

use crate::gateway::GatewayError;
use crate::task::OutcomeKind;

/// Invalid configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal error of a single dispatch
///
/// Never affects sibling dispatches or the poll loop; it is handed to the
/// caller's supervision layer through the worker's error channel.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The engine refused the report, usually because the lease was lost
    #[error("Not able to mark {kind} for task_id={task_id} for topic={topic}, worker_id={worker_id}")]
    NotAcknowledged {
        kind: OutcomeKind,
        task_id: String,
        topic: String,
        worker_id: String,
    },

    /// The report call itself failed
    #[error("failed to report {kind} for task_id={task_id} for topic={topic}, worker_id={worker_id}: {source}")]
    Report {
        kind: OutcomeKind,
        task_id: String,
        topic: String,
        worker_id: String,
        #[source]
        source: GatewayError,
    },

    /// The handler returned without producing an outcome
    #[error("task result for task_id={task_id} for topic={topic}, worker_id={worker_id} must be either complete/failure/BPMNError")]
    UnsetOutcome {
        task_id: String,
        topic: String,
        worker_id: String,
    },

    /// The dispatch was cancelled by shutdown
    #[error("dispatch of task_id={task_id} for topic={topic} was cancelled")]
    Cancelled { task_id: String, topic: String },

    /// A newer offer of the same task replaced this dispatch; nothing was reported
    #[error("dispatch of task_id={task_id} for topic={topic} was superseded by a newer offer")]
    Superseded { task_id: String, topic: String },
}

impl DispatchError {
    pub fn task_id(&self) -> &str {
        match self {
            Self::NotAcknowledged { task_id, .. }
            | Self::Report { task_id, .. }
            | Self::UnsetOutcome { task_id, .. }
            | Self::Cancelled { task_id, .. }
            | Self::Superseded { task_id, .. } => task_id,
        }
    }

    /// Cancellation is expected during shutdown and re-offers
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Superseded { .. })
    }

    /// The engine has no record of our outcome and the lease was likely lost
    pub fn is_lease_race(&self) -> bool {
        matches!(self, Self::NotAcknowledged { .. })
    }
}

/// Worker lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// A stopped worker cannot be restarted
    #[error("worker has been stopped")]
    Stopped,

    /// No topics were given to subscribe to
    #[error("no topic subscriptions given")]
    NoSubscriptions,

    /// Duplicate topic in one subscription set
    #[error("topic subscribed twice: {0}")]
    DuplicateTopic(String),

    /// Graceful shutdown timeout
    #[error("graceful shutdown timed out with {remaining} dispatch(es) still running")]
    ShutdownTimeout { remaining: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_acknowledged_message_has_context() {
        let err = DispatchError::NotAcknowledged {
            kind: OutcomeKind::Success,
            task_id: "t-1".into(),
            topic: "charge".into(),
            worker_id: "w-1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Not able to mark complete for task_id=t-1 for topic=charge, worker_id=w-1"
        );
        assert!(err.is_lease_race());
        assert!(!err.is_cancelled());
        assert_eq!(err.task_id(), "t-1");
    }

    #[test]
    fn test_superseded_counts_as_cancellation() {
        let err = DispatchError::Superseded {
            task_id: "t-1".into(),
            topic: "charge".into(),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_lease_race());
        assert_eq!(err.task_id(), "t-1");
    }
}
