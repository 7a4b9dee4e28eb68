use thiserror::Error;

/// Custom error types for the Print Sentinel detector.
///
/// Every failure the detector can observe falls into one of the concern
/// specific enums below. Only configuration errors are fatal; everything else
/// is recovered inside the sampling loop and reported through logging or the
/// notification sink.

/// Main error type for Print Sentinel operations.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// A feature vector violated the session's arity or finiteness rules.
    #[error("Feature vector error: {0}")]
    Vector(#[from] VectorError),

    /// The inference service timed out or returned garbage.
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    /// Printer telemetry could not be read.
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// A corrective command sent to the printer failed.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// Configuration and setup errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised when appending to the feature buffer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    /// The vector length differs from the arity fixed at session start.
    #[error("expected {expected} features, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    /// A slot holds NaN or an infinity.
    #[error("feature {index} is not finite ({value})")]
    NonFinite { index: usize, value: f64 },
}

/// Errors specific to the remote inference service.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The request did not complete within the configured timeout.
    #[error("request to '{url}' timed out after {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// Transport failure or non-success status.
    #[error("request to '{url}' failed: {reason}")]
    RequestFailed { url: String, reason: String },

    /// The response body could not be understood.
    #[error("malformed inference response: {reason}")]
    BadResponse { reason: String },

    /// No inference endpoint is available.
    #[error("inference service is not configured")]
    NotConfigured,
}

impl InferenceError {
    /// Whether the failure was a timeout rather than a hard error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InferenceError::Timeout { .. })
    }
}

/// Errors specific to telemetry collection.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A sensor field is absent; callers substitute a default.
    #[error("telemetry field '{field}' is missing")]
    Missing { field: String },

    /// The telemetry source could not be queried at all.
    #[error("telemetry source unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors raised by corrective printer commands.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("failed to {action}: {reason}")]
    ExecutionFailed { action: String, reason: String },
}

/// Errors related to configuration and application setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("Required environment variable '{var_name}' is not set")]
    MissingEnvVar { var_name: String },

    /// Invalid configuration values provided.
    #[error("Invalid value '{value}' for field '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Window sizes are unusable for outlier tracking.
    #[error("Invalid outlier windows: {reason}")]
    InvalidWindows { reason: String },

    /// Settings file could not be read or parsed.
    #[error("Failed to read settings file '{path}': {reason}")]
    FileReadError { path: String, reason: String },
}

pub type Result<T, E = SentinelError> = std::result::Result<T, E>;
