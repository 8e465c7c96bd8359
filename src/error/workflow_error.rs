//! Run-time error types.

use thiserror::Error;

use super::ErrorList;

/// Errors raised while preparing or driving a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("validation failed:\n{0}")]
    Validation(#[from] ErrorList),
    #[error("cycle detected in step dependencies")]
    Cycle,
    #[error("step not found: {0}")]
    StepNotFound(String),
    #[error("unknown executor type: {0}")]
    UnknownExecutor(String),
    #[error("failed to resolve {what}: {message}")]
    Resolution { what: String, message: String },
    #[error("remote capsule {capsule}: {message}")]
    Remote { capsule: String, message: String },
    #[error("command failed with exit code {code}")]
    ExitCode { code: i32 },
    #[error("command terminated by signal")]
    Terminated,
    #[error("workflow timeout")]
    Timeout,
    #[error("workflow canceled")]
    Canceled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("precondition not met: expected `{expected}`, got `{actual}`")]
    ConditionNotMet { expected: String, actual: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Helper for resolution-kind failures.
    pub fn resolution(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        WorkflowError::Resolution {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Helper for remote-capsule failures.
    pub fn remote(capsule: impl Into<String>, message: impl std::fmt::Display) -> Self {
        WorkflowError::Remote {
            capsule: capsule.into(),
            message: message.to_string(),
        }
    }

    /// Whether a retry policy applies to this error. Only genuine execution
    /// failures are retried; resolution and internal errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::ExitCode { .. } | WorkflowError::Terminated
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            WorkflowError::ExitCode { code: 2 }.to_string(),
            "command failed with exit code 2"
        );
        assert_eq!(
            WorkflowError::UnknownExecutor("docker".into()).to_string(),
            "unknown executor type: docker"
        );
        assert_eq!(
            WorkflowError::resolution("dotenv", "no such file").to_string(),
            "failed to resolve dotenv: no such file"
        );
        assert_eq!(WorkflowError::Cycle.to_string(), "cycle detected in step dependencies");
    }

    #[test]
    fn test_retryable() {
        assert!(WorkflowError::ExitCode { code: 1 }.is_retryable());
        assert!(WorkflowError::Terminated.is_retryable());
        assert!(!WorkflowError::Timeout.is_retryable());
        assert!(!WorkflowError::resolution("x", "y").is_retryable());
    }
}
