//! Error types for the policy machinery.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for policy operations.
pub type AuthzResult<T> = Result<T, AuthzError>;

/// Errors that can occur while loading or evaluating policies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthzError {
    /// The policy directory could not be read.
    #[error("failed to load policy module from {path}: {message}")]
    ModuleLoad {
        /// Directory that was being read.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// The policy source could not be compiled.
    #[error("failed to compile policy module: {0}")]
    ModuleCompile(String),

    /// Policy evaluation failed.
    #[error("policy evaluation failed: {0}")]
    Evaluation(String),

    /// A route referenced a policy with no matching rule in the module.
    #[error("policy not found in module: {0}")]
    PolicyNotFound(String),

    /// The policy input could not be serialized.
    #[error("invalid policy input: {0}")]
    InvalidInput(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuthzError {
    /// Create a module-load error.
    pub fn module_load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ModuleLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an evaluation error.
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation(message.into())
    }

    /// True when the error means a referenced policy does not exist.
    pub const fn is_policy_not_found(&self) -> bool {
        matches!(self, Self::PolicyNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_load_display() {
        let err = AuthzError::module_load("/etc/policies", "directory not found");
        assert!(err.to_string().contains("/etc/policies"));
        assert!(err.to_string().contains("directory not found"));
    }

    #[test]
    fn test_policy_not_found() {
        let err = AuthzError::PolicyNotFound("foobar".to_string());
        assert!(err.is_policy_not_found());
        assert_eq!(err.to_string(), "policy not found in module: foobar");
    }
}
