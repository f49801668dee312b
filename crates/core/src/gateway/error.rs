//! Errors raised by the remote task gateway

use std::fmt;
use std::time::Duration;

/// Failure of a remote call that could not complete
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Connection refused, reset, DNS failure, ...
    #[error("transport error: {0}")]
    Transport(String),

    /// The call exceeded its client-side deadline
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The engine answered with a non-success status
    #[error("{}", RemoteMessage { status: *status, error_type: error_type.as_deref(), message: message.as_deref() })]
    Remote {
        status: u16,
        error_type: Option<String>,
        message: Option<String>,
    },

    /// The response body could not be decoded
    #[error("invalid response: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn remote(status: u16, error_type: Option<String>, message: Option<String>) -> Self {
        Self::Remote {
            status,
            error_type,
            message,
        }
    }

    /// Remote HTTP status, if the engine answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Engine error type (e.g. `RestException`), if one was returned
    pub fn error_type(&self) -> Option<&str> {
        match self {
            Self::Remote { error_type, .. } => error_type.as_deref(),
            _ => None,
        }
    }

    /// Whether retrying the same call later may succeed
    ///
    /// Transport failures, timeouts and 5xx answers are transient; 4xx answers
    /// carry a structured engine error and are protocol errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Remote { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

struct RemoteMessage<'a> {
    status: u16,
    error_type: Option<&'a str>,
    message: Option<&'a str>,
}

impl fmt::Display for RemoteMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "received {}", self.status)?;
        if let Some(error_type) = self.error_type.filter(|t| !t.is_empty()) {
            write!(f, " : {error_type}")?;
        }
        if let Some(message) = self.message.filter(|m| !m.is_empty()) {
            write!(f, " : {message}")?;
        }
        Ok(())
    }
}
