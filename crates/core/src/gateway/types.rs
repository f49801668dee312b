//! Request and response types exchanged with the remote engine

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::variables::{ExtensionProperties, Variables};

/// One task offered by the engine in a claim response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOffer {
    pub id: String,
    pub topic_name: String,
    pub worker_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub process_definition_key: Option<String>,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    /// Retries remaining; absent until the first failure has been reported
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_variables: Option<Variables>,
    #[serde(default)]
    pub extension_properties: ExtensionProperties,
}

impl TaskOffer {
    pub fn new(
        id: impl Into<String>,
        topic_name: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            topic_name: topic_name.into(),
            worker_id: worker_id.into(),
            tenant_id: None,
            business_key: None,
            process_instance_id: None,
            process_definition_key: None,
            activity_id: None,
            priority: None,
            retries: None,
            variables: Variables::new(),
            local_variables: None,
            extension_properties: ExtensionProperties::new(),
        }
    }

    pub fn with_retries(mut self, retries: Option<u32>) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_extension_properties(mut self, properties: ExtensionProperties) -> Self {
        self.extension_properties = properties;
        self
    }
}

/// Per-topic part of a claim request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
    pub topic_name: String,

    /// How long the engine keeps the lease, in milliseconds
    #[serde(with = "crate::config::duration_millis")]
    pub lock_duration: Duration,

    /// Only fetch these variables (all when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<String>>,

    /// Only offer tasks whose process has these variable values
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub process_variables: BTreeMap<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id_in: Option<Vec<String>>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub without_tenant_id: bool,

    pub include_extension_properties: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub local_variables: bool,
}

/// Claim-batch request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub worker_id: String,
    pub max_tasks: usize,
    pub use_priority: bool,

    /// Server-side long-poll window
    #[serde(rename = "asyncResponseTimeout", with = "crate::config::duration_millis")]
    pub long_poll_timeout: Duration,

    pub topics: Vec<TopicRequest>,
}

impl ClaimRequest {
    /// Names of all topics in the request
    pub fn topic_names(&self) -> Vec<&str> {
        self.topics.iter().map(|t| t.topic_name.as_str()).collect()
    }
}

/// Retryable failure as sent to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub message: String,
    pub details: Option<String>,
    pub retries: u32,
    pub retry_delay: Duration,
}

/// Result of one claim attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The long poll expired without work
    Empty,

    /// At least one task was leased
    Tasks(Vec<TaskOffer>),
}

impl Claim {
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Tasks(tasks) => tasks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<TaskOffer>> for Claim {
    fn from(tasks: Vec<TaskOffer>) -> Self {
        if tasks.is_empty() {
            Self::Empty
        } else {
            Self::Tasks(tasks)
        }
    }
}
