// HTTP gateway to the engine's external task REST API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use extask_core::gateway::{ClaimRequest, FailureReport, GatewayError, RemoteTaskGateway, TaskOffer};
use extask_core::{ConfigError, Variables};

use crate::config::ClientConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteBody<'a> {
    worker_id: &'a str,
    variables: &'a Variables,
    #[serde(skip_serializing_if = "no_variables")]
    local_variables: &'a Variables,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FailureBody<'a> {
    worker_id: &'a str,
    error_message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<&'a str>,
    retries: u32,
    retry_timeout: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BpmnErrorBody<'a> {
    worker_id: &'a str,
    error_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "no_variables")]
    variables: &'a Variables,
}

fn no_variables(variables: &&Variables) -> bool {
    variables.is_empty()
}

/// Error body returned by the engine on non-2xx responses
#[derive(Debug, Default, Deserialize)]
struct EngineErrorBody {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Engine REST client implementing [`RemoteTaskGateway`]
#[derive(Debug, Clone)]
pub struct EngineClient {
    external_task_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl EngineClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(auth) = &config.auth {
            let mut value = HeaderValue::from_str(&auth.header_value())
                .map_err(|_| ConfigError::Invalid("credentials are not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::Invalid(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConfigError::Invalid(format!("invalid value for header {name}")))?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            external_task_url: format!("{}/external-task", config.base_url.trim_end_matches('/')),
            http,
            request_timeout: config.request_timeout,
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}{}", self.external_task_url, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            return Ok(response);
        }
        Err(remote_error(response).await)
    }

    /// POST a report; true only when the engine answers 204
    async fn report<B: Serialize + ?Sized>(
        &self,
        task_id: &str,
        action: &str,
        body: &B,
    ) -> Result<bool, GatewayError> {
        let response = self.post(&format!("/{task_id}/{action}"), body).await?;
        let acknowledged = response.status() == StatusCode::NO_CONTENT;
        debug!(
            task_id = %task_id,
            action,
            status = response.status().as_u16(),
            acknowledged,
            "Engine answered report"
        );
        Ok(acknowledged)
    }

    fn transport_error(&self, error: reqwest::Error) -> GatewayError {
        if error.is_timeout() {
            GatewayError::Timeout(self.request_timeout)
        } else {
            GatewayError::Transport(error.to_string())
        }
    }
}

async fn remote_error(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let body = response
        .json::<EngineErrorBody>()
        .await
        .unwrap_or_default();
    GatewayError::remote(
        status,
        body.error_type.filter(|t| !t.is_empty()),
        body.message.filter(|m| !m.is_empty()),
    )
}

#[async_trait]
impl RemoteTaskGateway for EngineClient {
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<TaskOffer>, GatewayError> {
        debug!(
            worker_id = %request.worker_id,
            topics = ?request.topic_names(),
            max_tasks = request.max_tasks,
            "fetchAndLock"
        );
        let response = self.post("/fetchAndLock", request).await?;
        response.json::<Vec<TaskOffer>>().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.request_timeout)
            } else {
                GatewayError::Decode(e.to_string())
            }
        })
    }

    async fn report_success(
        &self,
        worker_id: &str,
        task_id: &str,
        global_variables: &Variables,
        local_variables: &Variables,
    ) -> Result<bool, GatewayError> {
        let body = CompleteBody {
            worker_id,
            variables: global_variables,
            local_variables,
        };
        self.report(task_id, "complete", &body).await
    }

    async fn report_failure(
        &self,
        worker_id: &str,
        task_id: &str,
        report: &FailureReport,
    ) -> Result<bool, GatewayError> {
        let body = FailureBody {
            worker_id,
            error_message: &report.message,
            error_details: report.details.as_deref(),
            retries: report.retries,
            retry_timeout: report.retry_delay.as_millis() as u64,
        };
        self.report(task_id, "failure", &body).await
    }

    async fn report_business_error(
        &self,
        worker_id: &str,
        task_id: &str,
        code: &str,
        message: Option<&str>,
        variables: &Variables,
    ) -> Result<bool, GatewayError> {
        let body = BpmnErrorBody {
            worker_id,
            error_code: code,
            error_message: message,
            variables,
        };
        self.report(task_id, "bpmnError", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_body_shape() {
        let body = FailureBody {
            worker_id: "w-1",
            error_message: "Task execution failed",
            error_details: None,
            retries: 2,
            retry_timeout: 300_000,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "workerId": "w-1",
                "errorMessage": "Task execution failed",
                "retries": 2,
                "retryTimeout": 300000
            })
        );
    }

    #[test]
    fn test_complete_body_omits_empty_locals() {
        let global = Variables::new().with("approved", true);
        let local = Variables::new();
        let body = CompleteBody {
            worker_id: "w-1",
            variables: &global,
            local_variables: &local,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"workerId": "w-1", "variables": {"approved": {"value": true}}})
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = EngineClient::new(&ClientConfig::new("http://engine:8080/engine-rest/")).unwrap();
        assert_eq!(
            client.external_task_url,
            "http://engine:8080/engine-rest/external-task"
        );
    }

    #[test]
    fn test_invalid_header_rejected() {
        let config = ClientConfig::default().with_header("bad header", "x");
        assert!(EngineClient::new(&config).is_err());
    }
}
