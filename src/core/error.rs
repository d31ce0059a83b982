//! # Error Handling
//!
//! Error taxonomy for the optimization pipeline, built on `thiserror`.
//!
//! Errors fall into four families and callers are expected to branch on them:
//! - **Request** errors describe the caller's own input (`UnknownCacheType`,
//!   `UnknownModelType`, `InvalidRequest`) and always reach the immediate caller.
//! - **Capacity** errors (`NoCapacityAvailable`, `BatchExecution`, `RequestTimeout`)
//!   reach the callers they concern; a batch failure reaches every caller of
//!   that batch. No automatic retry is attempted.
//! - **Infrastructure** errors (`CacheBackendUnavailable`) are absorbed by the
//!   cache layer and only logged; they are part of the enum so the absorbing
//!   code and the stats can name them.
//! - **Internal** errors cover configuration, serialization and shutdown.
//!
//! `OptimizerError` is `Clone` because a single batch failure is fanned out to
//! every request waiting on that batch.

use serde::Serialize;
use thiserror::Error;

/// Main result type used throughout the optimizer
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Error types surfaced by the cache, load balancing, scaling and batching layers
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizerError {
    /// A cache type that is not present in the static cache-type table
    #[error("Unknown cache type: {cache_type}")]
    UnknownCacheType { cache_type: String },

    /// The request payload is missing required fields
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// A model type with no batching configuration
    #[error("Unknown model type: {model_type}")]
    UnknownModelType { model_type: String },

    /// A cache level could not be reached
    #[error("Cache backend unavailable ({backend}): {reason}")]
    CacheBackendUnavailable { backend: String, reason: String },

    /// No healthy, circuit-closed instance exists for the service type
    #[error("No capacity available for service type: {service_type}")]
    NoCapacityAvailable { service_type: String },

    /// The request was not resolved before its deadline
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: String, timeout_ms: u64 },

    /// The downstream call for a whole batch failed
    #[error("Batch execution failed for model {model_type}: {reason}")]
    BatchExecution { model_type: String, reason: String },

    /// The auto-scaler refused to act (boundary or cooldown)
    #[error("Scaling policy prevents action for {service_type}: {reason}")]
    ScalingPolicyViolation { service_type: String, reason: String },

    /// The component is draining and no longer accepts work
    #[error("Optimizer is shutting down")]
    ShuttingDown,

    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Value could not be encoded or decoded
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Unexpected internal state
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification used by callers to decide between retrying,
/// fixing the request and reporting degraded infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or unsupported request; retrying will not help
    Request,
    /// Not enough capacity right now; retry later
    Capacity,
    /// A backing service is degraded
    Infrastructure,
    /// Bug, misconfiguration or shutdown
    Internal,
}

impl OptimizerError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a serialization error with a custom message
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an invalid-request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a no-capacity error for a service type
    pub fn no_capacity<S: Into<String>>(service_type: S) -> Self {
        Self::NoCapacityAvailable {
            service_type: service_type.into(),
        }
    }

    /// Create a batch execution error
    pub fn batch_execution<S: Into<String>, R: Into<String>>(model_type: S, reason: R) -> Self {
        Self::BatchExecution {
            model_type: model_type.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownCacheType { .. } | Self::UnknownModelType { .. } | Self::InvalidRequest { .. } => {
                ErrorCategory::Request
            }
            Self::RequestTimeout { .. } => ErrorCategory::Capacity,
            Self::NoCapacityAvailable { .. } | Self::BatchExecution { .. } => ErrorCategory::Capacity,
            Self::CacheBackendUnavailable { .. } => ErrorCategory::Infrastructure,
            Self::ScalingPolicyViolation { .. } => ErrorCategory::Internal,
            Self::ShuttingDown
            | Self::Configuration { .. }
            | Self::Serialization { .. }
            | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Check if the caller may reasonably retry this request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoCapacityAvailable { .. }
                | Self::RequestTimeout { .. }
                | Self::BatchExecution { .. }
                | Self::CacheBackendUnavailable { .. }
        )
    }

    /// Short machine-readable error code for metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCacheType { .. } => "unknown_cache_type",
            Self::UnknownModelType { .. } => "unknown_model_type",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::CacheBackendUnavailable { .. } => "cache_backend_unavailable",
            Self::NoCapacityAvailable { .. } => "no_capacity",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::BatchExecution { .. } => "batch_execution",
            Self::ScalingPolicyViolation { .. } => "scaling_policy_violation",
            Self::ShuttingDown => "shutting_down",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for OptimizerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for OptimizerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("YAML error: {}", err),
        }
    }
}

impl From<std::io::Error> for OptimizerError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}
