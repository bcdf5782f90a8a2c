//! Error types for the CAPVCD provider
//!
//! Every error carries a classification that drives retry behaviour:
//! transient errors back off and retry, conflicts retry immediately once,
//! terminal errors park the resource in `Failed` until its spec changes,
//! and timeouts are reported separately so "stuck" is distinguishable
//! from "rejected".

use std::time::Duration;

use thiserror::Error;

/// Retry classification of an error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network failure, rate limiting, 5xx, task still running
    Transient,
    /// Optimistic-lock mismatch on the Kubernetes API
    Conflict,
    /// Authentication failure, invalid spec, quota exceeded, rejected request
    Terminal,
    /// A platform task did not reach a terminal state before its deadline
    Timeout,
}

impl ErrorClass {
    /// Label used in metrics and status reasons
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Terminal => "terminal",
            ErrorClass::Timeout => "timeout",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Cloud Director API error ({status} {code}): {message}")]
    Platform {
        class: ErrorClass,
        status: u16,
        code: String,
        message: String,
    },

    #[error("Cloud Director task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("Timed out after {elapsed:?} waiting for {operation}")]
    TaskTimeout {
        operation: String,
        elapsed: Duration,
    },

    #[error("{kind} '{name}' exists but is owned by {found:?}, not {expected}")]
    NotOwned {
        kind: String,
        name: String,
        expected: String,
        found: Option<String>,
    },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' is in a failed state: {message}")]
    ExternalFailed {
        kind: String,
        name: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Conversion error: {0}")]
    ConversionError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build a platform error, classifying it from the HTTP status and body
    pub fn platform(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        let class = classify_platform_status(status, &code, &message);
        Error::Platform {
            class,
            status,
            code,
            message,
        }
    }

    /// Retry classification of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KubeError(kube::Error::Api(resp)) if resp.code == 409 => ErrorClass::Conflict,
            Error::KubeError(_) => ErrorClass::Transient,
            Error::Platform { class, .. } => *class,
            Error::TaskFailed { .. }
            | Error::NotOwned { .. }
            | Error::ExternalFailed { .. }
            | Error::ValidationError(_)
            | Error::ConfigError(_)
            | Error::ConversionError(_) => ErrorClass::Terminal,
            Error::TaskTimeout { .. } => ErrorClass::Timeout,
            Error::NotFound { .. } | Error::HttpError(_) | Error::SerializationError(_) => {
                ErrorClass::Transient
            }
        }
    }

    /// Check if this error should be retried automatically
    pub fn is_retriable(&self) -> bool {
        !matches!(self.class(), ErrorClass::Terminal)
    }

    /// Machine-readable reason written into status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubernetesAPIError",
            Error::Platform { status: 401 | 403, .. } => "AuthenticationFailed",
            Error::Platform { code, message, .. } if is_quota(code, message) => "QuotaExceeded",
            Error::Platform { class, .. } if *class == ErrorClass::Terminal => "RequestRejected",
            Error::Platform { .. } => "PlatformUnavailable",
            Error::TaskFailed { .. } => "TaskFailed",
            Error::TaskTimeout { .. } => "TaskTimeout",
            Error::NotOwned { .. } => "ResourceNotOwned",
            Error::NotFound { .. } => "ResourceNotFound",
            Error::ExternalFailed { .. } => "ResourceFailed",
            Error::HttpError(_) => "PlatformUnreachable",
            Error::SerializationError(_) => "SerializationError",
            Error::ValidationError(_) => "InvalidSpec",
            Error::ConfigError(_) => "ConfigError",
            Error::ConversionError(_) => "ConversionError",
        }
    }
}

fn is_quota(code: &str, message: &str) -> bool {
    code.eq_ignore_ascii_case("QUOTA_EXCEEDED") || message.to_ascii_lowercase().contains("quota")
}

/// Map an HTTP status from the platform onto a retry class
fn classify_platform_status(status: u16, code: &str, message: &str) -> ErrorClass {
    match status {
        429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        401 | 403 => ErrorClass::Terminal,
        _ if is_quota(code, message) => ErrorClass::Terminal,
        400..=499 => ErrorClass::Terminal,
        _ => ErrorClass::Transient,
    }
}
