//! Handle over one claimed external task

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use super::outcome::Outcome;
use crate::gateway::TaskOffer;
use crate::variables::{ExtensionProperties, Variables};

/// Retry bookkeeping derived from the engine's lease state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// The engine has not recorded a failed attempt yet
    Fresh,

    /// The engine reports `n` retries remaining
    Leased(u32),
}

impl RetryState {
    pub fn from_engine(retries: Option<u32>) -> Self {
        match retries {
            Some(n) => Self::Leased(n),
            None => Self::Fresh,
        }
    }

    /// Retries to report with the next failure
    ///
    /// A fresh task gets the configured ceiling as-is; a leased task counts
    /// down from what the engine reported, stopping at zero.
    pub fn after_failure(self, ceiling: u32) -> u32 {
        match self {
            Self::Fresh => ceiling,
            Self::Leased(n) => n.saturating_sub(1),
        }
    }
}

struct TaskInner {
    offer: TaskOffer,
    outcome: Mutex<Outcome>,
}

/// Immutable view of a claimed task plus its write-once outcome slot
///
/// Cloning is cheap; clones share the same outcome slot, so a handler can
/// record its result through `complete` / `fail` / `bpmn_error` and let the
/// dispatcher pick it up afterwards.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub fn new(offer: TaskOffer) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                offer,
                outcome: Mutex::new(Outcome::Unset),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.offer.id
    }

    pub fn topic_name(&self) -> &str {
        &self.inner.offer.topic_name
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.offer.worker_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.inner.offer.tenant_id.as_deref()
    }

    pub fn business_key(&self) -> Option<&str> {
        self.inner.offer.business_key.as_deref()
    }

    pub fn process_instance_id(&self) -> Option<&str> {
        self.inner.offer.process_instance_id.as_deref()
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.inner.offer.activity_id.as_deref()
    }

    pub fn variables(&self) -> &Variables {
        &self.inner.offer.variables
    }

    /// Plain value of a (global scope) variable
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.inner.offer.variables.get(name)
    }

    pub fn local_variables(&self) -> Option<&Variables> {
        self.inner.offer.local_variables.as_ref()
    }

    pub fn extension_properties(&self) -> &ExtensionProperties {
        &self.inner.offer.extension_properties
    }

    pub fn extension_property(&self, name: &str) -> Option<&str> {
        self.inner.offer.extension_properties.get(name)
    }

    /// Retries remaining as reported by the engine at claim time
    pub fn retries(&self) -> Option<u32> {
        self.inner.offer.retries
    }

    pub fn retry_state(&self) -> RetryState {
        RetryState::from_engine(self.inner.offer.retries)
    }

    /// Current content of the outcome slot
    pub fn outcome(&self) -> Outcome {
        self.inner.outcome.lock().clone()
    }

    /// Record a successful completion
    pub fn complete(&self, global_variables: Variables, local_variables: Variables) -> Outcome {
        self.record(Outcome::success(global_variables, local_variables))
    }

    /// Record a retryable failure
    ///
    /// `max_retries` is only used when the engine has not reported a retry
    /// count yet; otherwise the engine's count is decremented.
    pub fn fail(
        &self,
        message: impl Into<String>,
        details: Option<String>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Outcome {
        let retries = self.retry_state().after_failure(max_retries);
        self.record(Outcome::retryable_failure(
            message,
            details,
            retries,
            retry_delay,
        ))
    }

    /// Record a BPMN (business) error
    pub fn bpmn_error(
        &self,
        code: impl Into<String>,
        message: Option<String>,
        variables: Variables,
    ) -> Outcome {
        self.record(Outcome::business_error(code, message, variables))
    }

    /// Store `outcome` unless a terminal outcome is already present
    ///
    /// Returns the outcome that now occupies the slot.
    pub(crate) fn settle(&self, outcome: Outcome) -> Outcome {
        let mut slot = self.inner.outcome.lock();
        if !slot.is_terminal() {
            *slot = outcome;
        }
        slot.clone()
    }

    fn record(&self, outcome: Outcome) -> Outcome {
        let mut slot = self.inner.outcome.lock();
        if slot.is_terminal() {
            warn!(
                task_id = %self.id(),
                topic = %self.topic_name(),
                existing = %slot.kind(),
                ignored = %outcome.kind(),
                "Outcome already recorded for this dispatch, keeping the first one"
            );
        } else {
            *slot = outcome.clone();
        }
        outcome
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("topic_name", &self.topic_name())
            .field("worker_id", &self.worker_id())
            .field("business_key", &self.business_key())
            .field("retries", &self.retries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn handle(retries: Option<u32>) -> TaskHandle {
        TaskHandle::new(TaskOffer::new("task-1", "payments", "worker-1").with_retries(retries))
    }

    #[test]
    fn test_accessors() {
        let offer = TaskOffer::new("task-1", "payments", "worker-1")
            .with_business_key("order-9")
            .with_tenant_id("acme")
            .with_variables(Variables::new().with("amount", 12))
            .with_extension_properties(ExtensionProperties::new().with("owner", "billing"));
        let task = TaskHandle::new(offer);

        assert_eq!(task.id(), "task-1");
        assert_eq!(task.topic_name(), "payments");
        assert_eq!(task.worker_id(), "worker-1");
        assert_eq!(task.business_key(), Some("order-9"));
        assert_eq!(task.tenant_id(), Some("acme"));
        assert_eq!(task.variable("amount"), Some(json!(12)));
        assert_eq!(task.extension_property("owner"), Some("billing"));
        assert!(task.local_variables().is_none());
        assert_eq!(task.retry_state(), RetryState::Fresh);
    }

    #[test]
    fn test_fail_decrements_engine_retries() {
        let task = handle(Some(3));
        let outcome = task.fail("boom", None, 10, Duration::from_secs(5));
        assert!(matches!(
            outcome,
            Outcome::RetryableFailure {
                retries_remaining: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_fail_uses_ceiling_when_fresh() {
        let task = handle(None);
        let outcome = task.fail("boom", None, 7, Duration::from_secs(5));
        assert!(matches!(
            outcome,
            Outcome::RetryableFailure {
                retries_remaining: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_retries_stay_zero() {
        assert_eq!(RetryState::Leased(0).after_failure(5), 0);
    }

    #[test]
    fn test_outcome_slot_is_write_once() {
        let task = handle(None);
        assert_eq!(task.outcome(), Outcome::Unset);

        let first = task.complete(Variables::new().with("x", 1), Variables::new());
        let returned = task.bpmn_error("E1", None, Variables::new());

        assert!(returned.is_business_error());
        assert_eq!(task.outcome(), first);
        assert_eq!(
            task.settle(Outcome::business_error("E2", None, Variables::new())),
            first
        );
    }

    #[test]
    fn test_clones_share_slot() {
        let task = handle(None);
        let clone = task.clone();
        clone.bpmn_error("E1", Some("bad input".into()), Variables::new());
        assert!(task.outcome().is_business_error());
    }

    proptest! {
        #[test]
        fn engine_count_is_decremented_by_one(r in 0u32..1000, ceiling in 0u32..1000) {
            let task = handle(Some(r + 1));
            let outcome = task.fail("x", None, ceiling, Duration::ZERO);
            let matched = matches!(outcome, Outcome::RetryableFailure { retries_remaining, .. } if retries_remaining == r);
            prop_assert!(matched);
        }

        #[test]
        fn fresh_task_uses_ceiling_verbatim(ceiling in 0u32..1000) {
            prop_assert_eq!(RetryState::Fresh.after_failure(ceiling), ceiling);
        }
    }
}
