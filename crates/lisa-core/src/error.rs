use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The last error observed for one provider during a failover pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.provider, self.kind, self.message)
    }
}

#[derive(Debug, Error)]
pub enum LisaError {
    // Submission validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    // Upstream call errors
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    #[error("Permanent backend error: {0}")]
    PermanentBackend(String),

    #[error("Circuit open for '{operation}' (retry in {retry_after_ms}ms)")]
    CircuitOpen {
        operation: String,
        retry_after_ms: u64,
    },

    #[error("Capability {capability} failed: {message}")]
    CapabilityFailed { capability: String, message: String },

    #[error("All providers failed for {capability}: {}", format_failures(.failures))]
    ProvidersExhausted {
        capability: String,
        failures: Vec<ProviderFailure>,
    },

    // Expression errors
    #[error("Unsafe expression: {0}")]
    UnsafeExpression(String),

    #[error("Expression error: {0}")]
    Expression(String),

    // Task lifecycle errors
    #[error("Blocked by failed dependency '{dependency}'")]
    BlockedByDependency { dependency: String },

    #[error("Submission cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse classification of a [`LisaError`], stable enough to serialize into reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    CapabilityNotFound,
    Timeout,
    TransientBackend,
    PermanentBackend,
    CircuitOpen,
    CapabilityFailed,
    ProvidersExhausted,
    UnsafeExpression,
    Expression,
    BlockedByDependency,
    Cancelled,
    TaskPanicked,
    Config,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::CapabilityNotFound => "capability_not_found",
            Self::Timeout => "timeout",
            Self::TransientBackend => "transient_backend",
            Self::PermanentBackend => "permanent_backend",
            Self::CircuitOpen => "circuit_open",
            Self::CapabilityFailed => "capability_failed",
            Self::ProvidersExhausted => "providers_exhausted",
            Self::UnsafeExpression => "unsafe_expression",
            Self::Expression => "expression",
            Self::BlockedByDependency => "blocked_by_dependency",
            Self::Cancelled => "cancelled",
            Self::TaskPanicked => "task_panicked",
            Self::Config => "config",
            Self::Io => "io",
        };
        f.write_str(s)
    }
}

impl LisaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::CyclicDependency { .. }
            | Self::UnknownDependency { .. }
            | Self::DuplicateTask(_) => ErrorKind::Validation,
            Self::CapabilityNotFound(_) => ErrorKind::CapabilityNotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::TransientBackend(_) => ErrorKind::TransientBackend,
            Self::PermanentBackend(_) => ErrorKind::PermanentBackend,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::CapabilityFailed { .. } => ErrorKind::CapabilityFailed,
            Self::ProvidersExhausted { .. } => ErrorKind::ProvidersExhausted,
            Self::UnsafeExpression(_) => ErrorKind::UnsafeExpression,
            Self::Expression(_) => ErrorKind::Expression,
            Self::BlockedByDependency { .. } => ErrorKind::BlockedByDependency,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TaskPanicked(_) => ErrorKind::TaskPanicked,
            Self::Config(_) | Self::ConfigNotFound(_) => ErrorKind::Config,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Whether the resilient invoker may try the operation again.
    ///
    /// Only timeouts and transient backend failures qualify. An open circuit is
    /// never retried: the caller should fail over instead of waiting it out.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::TransientBackend(_))
    }

    /// Errors that reject a whole submission before any task runs.
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

pub type Result<T> = std::result::Result<T, LisaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LisaError::Timeout {
            operation: "op".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(LisaError::TransientBackend("503".into()).is_retryable());
        assert!(!LisaError::PermanentBackend("400".into()).is_retryable());
        assert!(!LisaError::CircuitOpen {
            operation: "op".into(),
            retry_after_ms: 5
        }
        .is_retryable());
        assert!(!LisaError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_validation_kinds() {
        assert!(LisaError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()]
        }
        .is_validation());
        assert!(LisaError::DuplicateTask("a".into()).is_validation());
        assert!(!LisaError::CapabilityNotFound("x".into()).is_validation());
    }

    #[test]
    fn test_cycle_display() {
        let e = LisaError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(e.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_exhausted_display_lists_providers() {
        let e = LisaError::ProvidersExhausted {
            capability: "complete".into(),
            failures: vec![
                ProviderFailure {
                    provider: "primary".into(),
                    kind: ErrorKind::Timeout,
                    message: "slow".into(),
                },
                ProviderFailure {
                    provider: "backup".into(),
                    kind: ErrorKind::TransientBackend,
                    message: "503".into(),
                },
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("primary (timeout): slow"));
        assert!(msg.contains("backup (transient_backend): 503"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BlockedByDependency).unwrap();
        assert_eq!(json, "\"blocked_by_dependency\"");
    }
}
