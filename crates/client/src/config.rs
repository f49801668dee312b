// Engine client configuration

use std::collections::BTreeMap;
use std::time::Duration;

use extask_core::{ConfigError, WorkerConfig};

use crate::auth::Auth;

/// Default engine REST root
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/engine-rest";

/// Configuration of the HTTP gateway
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Engine REST root, e.g. `http://localhost:8080/engine-rest`
    pub base_url: String,

    /// Deadline of every HTTP call; must exceed the worker's long-poll window
    pub request_timeout: Duration,

    pub auth: Option<Auth>,

    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            auth: None,
            headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `ENGINE_URL`: Engine REST root (default: `http://localhost:8080/engine-rest`)
    /// - `ENGINE_REQUEST_TIMEOUT_MS`: HTTP call deadline
    /// - `ENGINE_TOKEN`: Bearer token, takes precedence over basic credentials
    /// - `ENGINE_USERNAME` / `ENGINE_PASSWORD`: Basic credentials
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let auth = match (
            std::env::var("ENGINE_TOKEN").ok(),
            std::env::var("ENGINE_USERNAME").ok(),
        ) {
            (Some(token), _) => Some(Auth::bearer(token)),
            (None, Some(username)) => Some(Auth::basic(
                username,
                std::env::var("ENGINE_PASSWORD").unwrap_or_default(),
            )),
            (None, None) => None,
        };

        Self {
            base_url: std::env::var("ENGINE_URL").unwrap_or(defaults.base_url),
            request_timeout: std::env::var("ENGINE_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            auth,
            headers: defaults.headers,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Check this configuration against the worker that will use it
    ///
    /// The HTTP deadline must be strictly greater than the long-poll window,
    /// otherwise an empty long poll races the client timeout.
    pub fn validate_for(&self, worker: &WorkerConfig) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".into()));
        }
        if self.request_timeout <= worker.long_poll_timeout {
            return Err(ConfigError::Invalid(format!(
                "request_timeout ({}ms) must exceed long_poll_timeout ({}ms)",
                self.request_timeout.as_millis(),
                worker.long_poll_timeout.as_millis()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.auth.is_none());
        assert!(config.validate_for(&WorkerConfig::new("w")).is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_long_poll() {
        let worker = WorkerConfig::new("w").with_long_poll_timeout(Duration::from_secs(20));
        let config = ClientConfig::default().with_request_timeout(Duration::from_secs(20));
        assert!(config.validate_for(&worker).is_err());

        let config = config.with_request_timeout(Duration::from_secs(25));
        assert!(config.validate_for(&worker).is_ok());
    }
}
