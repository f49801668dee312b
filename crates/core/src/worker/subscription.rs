//! Topic subscriptions
//!
//! A [`TopicSubscription`] names a topic plus the claim filters sent with it;
//! [`Subscriptions`] pairs each one with the handler that processes its tasks.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::gateway::{ClaimRequest, TopicRequest};
use crate::task::{SharedHandler, TaskHandler};

/// Claim filters for one topic
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSubscription {
    topic_name: String,
    variables: Option<Vec<String>>,
    process_variables: BTreeMap<String, Value>,
    business_key: Option<String>,
    tenant_ids: Option<Vec<String>>,
    without_tenant_id: bool,
    include_extension_properties: bool,
    local_variables: bool,
    lease_duration: Option<Duration>,
}

impl TopicSubscription {
    pub fn new(topic_name: impl Into<String>) -> Self {
        Self {
            topic_name: topic_name.into(),
            variables: None,
            process_variables: BTreeMap::new(),
            business_key: None,
            tenant_ids: None,
            without_tenant_id: false,
            include_extension_properties: true,
            local_variables: false,
            lease_duration: None,
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// Only fetch the named variables
    pub fn with_variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Only claim tasks whose process has `name == value`
    pub fn with_process_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.process_variables.insert(name.into(), value.into());
        self
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn with_tenant_ids<I, S>(mut self, tenant_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tenant_ids = Some(tenant_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_tenant_id(mut self) -> Self {
        self.without_tenant_id = true;
        self
    }

    pub fn with_extension_properties(mut self, include: bool) -> Self {
        self.include_extension_properties = include;
        self
    }

    /// Fetch only variables local to the task's scope
    pub fn with_local_variables(mut self, local: bool) -> Self {
        self.local_variables = local;
        self
    }

    /// Override the worker-wide lease duration for this topic
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    pub fn lease_duration(&self, config: &WorkerConfig) -> Duration {
        self.lease_duration.unwrap_or(config.lease_duration)
    }

    /// Build the claim request for this topic
    pub fn to_request(&self, config: &WorkerConfig) -> ClaimRequest {
        ClaimRequest {
            worker_id: config.worker_id.clone(),
            max_tasks: config.max_tasks,
            use_priority: config.use_priority,
            long_poll_timeout: config.long_poll_timeout,
            topics: vec![TopicRequest {
                topic_name: self.topic_name.clone(),
                lock_duration: self.lease_duration(config),
                variables: self.variables.clone(),
                process_variables: self.process_variables.clone(),
                business_key: self.business_key.clone(),
                tenant_id_in: self.tenant_ids.clone(),
                without_tenant_id: self.without_tenant_id,
                include_extension_properties: self.include_extension_properties,
                local_variables: self.local_variables,
            }],
        }
    }
}

impl From<&str> for TopicSubscription {
    fn from(topic_name: &str) -> Self {
        Self::new(topic_name)
    }
}

impl From<String> for TopicSubscription {
    fn from(topic_name: String) -> Self {
        Self::new(topic_name)
    }
}

/// Topic subscriptions with their handlers
///
/// ```ignore
/// let subscriptions = Subscriptions::new()
///     .topic("charge-card", charge_card)
///     .topic(TopicSubscription::new("ship").with_business_key("order-1"), ship);
/// ```
#[derive(Default, Clone)]
pub struct Subscriptions {
    entries: Vec<(TopicSubscription, SharedHandler)>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic<H>(mut self, subscription: impl Into<TopicSubscription>, handler: H) -> Self
    where
        H: TaskHandler,
    {
        self.entries.push((subscription.into(), Arc::new(handler)));
        self
    }

    pub fn topic_shared(
        mut self,
        subscription: impl Into<TopicSubscription>,
        handler: SharedHandler,
    ) -> Self {
        self.entries.push((subscription.into(), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn topic_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(s, _)| s.topic_name()).collect()
    }

    /// Reject empty sets and topics subscribed twice
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.entries.is_empty() {
            return Err(WorkerError::NoSubscriptions);
        }
        let mut seen = HashSet::new();
        for (subscription, _) in &self.entries {
            if !seen.insert(subscription.topic_name()) {
                return Err(WorkerError::DuplicateTopic(subscription.topic_name().to_string()));
            }
        }
        Ok(())
    }

    pub(crate) fn into_entries(self) -> Vec<(TopicSubscription, SharedHandler)> {
        self.entries
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("topics", &self.topic_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Outcome, TaskHandle};
    use crate::variables::Variables;
    use serde_json::json;

    async fn noop(task: TaskHandle) -> anyhow::Result<Outcome> {
        Ok(task.complete(Variables::new(), Variables::new()))
    }

    #[test]
    fn test_request_uses_worker_defaults() {
        let config = WorkerConfig::new("w-1").with_max_tasks(1);
        let request = TopicSubscription::new("charge").to_request(&config);

        assert_eq!(request.worker_id, "w-1");
        assert_eq!(request.max_tasks, 1);
        assert_eq!(request.long_poll_timeout, config.long_poll_timeout);
        assert_eq!(request.topics.len(), 1);
        assert_eq!(request.topics[0].lock_duration, config.lease_duration);
        assert!(request.topics[0].include_extension_properties);
    }

    #[test]
    fn test_request_carries_filters() {
        let config = WorkerConfig::new("w-1");
        let request = TopicSubscription::new("charge")
            .with_variables(["amount", "currency"])
            .with_process_variable("region", "eu")
            .with_business_key("order-7")
            .with_tenant_ids(["acme"])
            .with_lease_duration(Duration::from_secs(20))
            .to_request(&config);

        let body = serde_json::to_value(&request).unwrap();
        let topic = &body["topics"][0];
        assert_eq!(topic["topicName"], "charge");
        assert_eq!(topic["lockDuration"], 20_000);
        assert_eq!(topic["variables"], json!(["amount", "currency"]));
        assert_eq!(topic["processVariables"], json!({"region": "eu"}));
        assert_eq!(topic["businessKey"], "order-7");
        assert_eq!(topic["tenantIdIn"], json!(["acme"]));
        assert_eq!(body["asyncResponseTimeout"], 5_000);
    }

    #[test]
    fn test_subscriptions_validation() {
        assert!(matches!(
            Subscriptions::new().validate(),
            Err(WorkerError::NoSubscriptions)
        ));

        let duplicated = Subscriptions::new().topic("a", noop).topic("a", noop);
        assert!(matches!(
            duplicated.validate(),
            Err(WorkerError::DuplicateTopic(t)) if t == "a"
        ));

        let ok = Subscriptions::new()
            .topic("a", noop)
            .topic(TopicSubscription::new("b").without_tenant_id(), noop);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.topic_names(), vec!["a", "b"]);
    }
}
