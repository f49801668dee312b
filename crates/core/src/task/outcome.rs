//! Task outcome produced by handler code

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::variables::Variables;

/// Classification of an [`Outcome`], used in logs and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Unset,
    Success,
    RetryableFailure,
    BusinessError,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Success => write!(f, "complete"),
            Self::RetryableFailure => write!(f, "failure"),
            Self::BusinessError => write!(f, "BPMN error"),
        }
    }
}

/// Result of one dispatch attempt
///
/// Exactly one of [`Outcome::is_success`], [`Outcome::is_retryable_failure`] and
/// [`Outcome::is_business_error`] holds for a terminal outcome; none holds for
/// [`Outcome::Unset`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Outcome {
    /// Nothing produced yet
    #[default]
    Unset,

    /// Task completed; variables are written back to the process
    Success {
        global_variables: Variables,
        local_variables: Variables,
    },

    /// Technical failure; the engine retries while `retries_remaining > 0`
    RetryableFailure {
        message: String,
        details: Option<String>,
        retries_remaining: u32,
        retry_delay: Duration,
    },

    /// Business error routed to a BPMN error boundary event
    BusinessError {
        code: String,
        message: Option<String>,
        variables: Variables,
    },
}

impl Outcome {
    pub fn success(global_variables: Variables, local_variables: Variables) -> Self {
        Self::Success {
            global_variables,
            local_variables,
        }
    }

    pub fn retryable_failure(
        message: impl Into<String>,
        details: Option<String>,
        retries_remaining: u32,
        retry_delay: Duration,
    ) -> Self {
        Self::RetryableFailure {
            message: message.into(),
            details,
            retries_remaining,
            retry_delay,
        }
    }

    pub fn business_error(
        code: impl Into<String>,
        message: Option<String>,
        variables: Variables,
    ) -> Self {
        Self::BusinessError {
            code: code.into(),
            message,
            variables,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Unset => OutcomeKind::Unset,
            Self::Success { .. } => OutcomeKind::Success,
            Self::RetryableFailure { .. } => OutcomeKind::RetryableFailure,
            Self::BusinessError { .. } => OutcomeKind::BusinessError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, Self::RetryableFailure { .. })
    }

    pub fn is_business_error(&self) -> bool {
        matches!(self, Self::BusinessError { .. })
    }

    /// True for every case except [`Outcome::Unset`]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unset)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Success {
                global_variables,
                local_variables,
            } => write!(
                f,
                "success: global_variables={}, local_variables={}",
                global_variables.len(),
                local_variables.len()
            ),
            Self::RetryableFailure {
                message,
                retries_remaining,
                retry_delay,
                ..
            } => write!(
                f,
                "failure: error_message={message}, retries={retries_remaining}, retry_timeout={}ms",
                retry_delay.as_millis()
            ),
            Self::BusinessError { code, message, .. } => {
                write!(f, "bpmn_error: error_code={code}")?;
                if let Some(message) = message {
                    write!(f, ", error_message={message}")?;
                }
                Ok(())
            }
        }
    }
}
