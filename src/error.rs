//! Coordinator error taxonomy.
//!
//! Every public operation returns `Result<T, CoordinatorError>`: exactly one
//! error kind plus a human-readable message. Errors are data, not control
//! flow — callers match on the kind to decide what to do.

use thiserror::Error;

use crate::exec::ExecError;

/// Typed error returned by all coordinator operations
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Name grammar, status value, progress range, or type value is invalid
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No session, relationship, or request exists for the given key
    #[error("not found: {0}")]
    NotFound(String),

    /// Relationship already bound, session/worktree already exists, or
    /// illegal status transition
    #[error("conflict: {0}")]
    Conflict(String),

    /// Role capability check failed
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// tmux or git returned non-zero, or the executor failed outright
    #[error("external failure: {0}")]
    ExternalFailure(String),

    /// Queue cap hit or circuit breaker open
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other unexpected condition
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Short machine-readable kind, stable across message changes
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidArgument(_) => "invalid_argument",
            CoordinatorError::NotFound(_) => "not_found",
            CoordinatorError::Conflict(_) => "conflict",
            CoordinatorError::SecurityViolation(_) => "security_violation",
            CoordinatorError::ExternalFailure(_) => "external_failure",
            CoordinatorError::ResourceExhausted(_) => "resource_exhausted",
            CoordinatorError::Internal(_) => "internal",
        }
    }

    /// CLI process exit code for this error.
    ///
    /// 1 = generic failure, 2 = invalid usage, 3 = external tool unavailable.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoordinatorError::InvalidArgument(_) => 2,
            CoordinatorError::ExternalFailure(_) => 3,
            _ => 1,
        }
    }
}

impl From<ExecError> for CoordinatorError {
    fn from(err: ExecError) -> Self {
        CoordinatorError::ExternalFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(
            CoordinatorError::InvalidArgument("x".into()).kind(),
            "invalid_argument"
        );
        assert_eq!(CoordinatorError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(
            CoordinatorError::SecurityViolation("x".into()).kind(),
            "security_violation"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CoordinatorError::InvalidArgument("x".into()).exit_code(), 2);
        assert_eq!(CoordinatorError::ExternalFailure("x".into()).exit_code(), 3);
        assert_eq!(CoordinatorError::Conflict("x".into()).exit_code(), 1);
    }
}
