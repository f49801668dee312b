//! Registry of locally running dispatches, keyed by task id
//!
//! A task id has at most one live dispatch per worker. When the engine offers a
//! task id that is still running here (its lease expired and was re-offered),
//! the newest offer wins: the older dispatch is cancelled before the new one is
//! registered. A superseded dispatch is flagged before its token fires so it
//! can tell replacement apart from shutdown and leave the new lease alone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug)]
struct Entry {
    generation: u64,
    topic: String,
    token: CancellationToken,
    superseded: Arc<AtomicBool>,
}

/// Registration of one dispatch; used to deregister it later
#[derive(Debug, Clone)]
pub struct InFlightTicket {
    pub task_id: String,
    pub generation: u64,
    pub token: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl InFlightTicket {
    /// Ticket for a dispatch that no registry tracks
    pub fn detached(task_id: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            task_id: task_id.into(),
            generation: 0,
            token,
            superseded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a newer offer of the same task replaced this dispatch
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }
}

/// In-flight task registry
#[derive(Debug)]
pub struct InFlightTasks {
    entries: DashMap<String, Entry>,
    next_generation: AtomicU64,
    scope: CancellationToken,
}

impl InFlightTasks {
    /// Dispatch tokens are children of `scope`, so cancelling it cancels all
    pub fn new(scope: CancellationToken) -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
            scope,
        }
    }

    /// Register a new dispatch for `task_id`, superseding any running one
    pub fn register(&self, task_id: &str, topic: &str) -> InFlightTicket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.scope.child_token();
        let superseded = Arc::new(AtomicBool::new(false));
        let previous = self.entries.insert(
            task_id.to_string(),
            Entry {
                generation,
                topic: topic.to_string(),
                token: token.clone(),
                superseded: Arc::clone(&superseded),
            },
        );

        if let Some(previous) = previous {
            warn!(
                task_id = %task_id,
                topic = %previous.topic,
                superseded_generation = previous.generation,
                "Task offered again while still running, cancelling previous dispatch"
            );
            previous.superseded.store(true, Ordering::Release);
            previous.token.cancel();
        }

        InFlightTicket {
            task_id: task_id.to_string(),
            generation,
            token,
            superseded,
        }
    }

    /// Remove the registration, unless a newer dispatch replaced it
    pub fn complete(&self, ticket: &InFlightTicket) -> bool {
        self.entries
            .remove_if(&ticket.task_id, |_, entry| {
                entry.generation == ticket.generation
            })
            .is_some()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all running dispatches
    pub fn task_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
