//! Error taxonomy and the wire error body.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sidecar operations.
pub type SidecarResult<T> = Result<T, SidecarError>;

/// Business message for requests that match no known API.
const MSG_NO_KNOWN_API: &str = "The request doesn't match any known API";
/// Business message for policy denials.
const MSG_POLICY_DENIED: &str = "RBAC policy evaluation failed";
/// Business message for routes declared without a policy.
const MSG_NO_PERMISSION: &str = "You do not have permissions to access this feature";
/// Business message for internal evaluation failures.
const MSG_EVALUATION_FAILED: &str = "The policy evaluation failed";
/// Business message for everything the caller cannot act on.
const MSG_INTERNAL: &str = "Internal server error";

/// Sidecar errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SidecarError {
    /// Startup configuration error; the process exits non-zero.
    #[error("configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// No OpenAPI template matches the request.
    #[error("not found oas definition: {method} {path}")]
    RouteNotFound {
        /// Request method.
        method: String,
        /// Routed request path.
        path: String,
    },

    /// The matched route declares no request-flow policy.
    #[error("missing policy for request flow: {method} {path}")]
    MissingPermission {
        /// Request method.
        method: String,
        /// Routed request path.
        path: String,
    },

    /// The policy evaluated to not-allowed.
    #[error("policy denied: {policy}")]
    PolicyDenied {
        /// Dot-notated policy name.
        policy: String,
    },

    /// Internal failure while cloning or evaluating a policy query.
    #[error("evaluation error: {message}")]
    Evaluation {
        /// Technical error message.
        message: String,
    },

    /// A required value was absent from the request context.
    #[error("{message}")]
    Context {
        /// Technical error message.
        message: String,
    },

    /// Failure while constructing the proxied request.
    #[error("proxy error: {message}")]
    Proxy {
        /// Error message.
        message: String,
    },

    /// Upstream transport failure.
    #[error("upstream error: {message}")]
    Upstream {
        /// Error message.
        message: String,
    },

    /// Server lifecycle error.
    #[error("server error: {message}")]
    Server {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream client error.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl SidecarError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a route-not-found error for `(method, path)`.
    pub fn route_not_found(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::RouteNotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Create a missing-permission error for `(method, path)`.
    pub fn missing_permission(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::MissingPermission {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Create a policy-denied error.
    pub fn policy_denied(policy: impl Into<String>) -> Self {
        Self::PolicyDenied {
            policy: policy.into(),
        }
    }

    /// Create an evaluation error.
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Create a context error.
    pub fn context(message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
        }
    }

    /// Create a proxy error.
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Create an upstream error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RouteNotFound { .. } => 404,
            Self::MissingPermission { .. } | Self::PolicyDenied { .. } => 403,
            Self::Proxy { .. } | Self::Upstream { .. } | Self::Request(_) => 502,
            Self::Config { .. }
            | Self::Evaluation { .. }
            | Self::Context { .. }
            | Self::Server { .. }
            | Self::Io(_)
            | Self::Http(_)
            | Self::Json(_) => 500,
        }
    }

    /// The wire body for this error.
    pub fn to_request_error(&self) -> RequestError {
        let status_code = self.status_code();
        let (error, message) = match self {
            Self::RouteNotFound { .. } => (self.to_string(), MSG_NO_KNOWN_API.to_string()),
            Self::MissingPermission { .. } => {
                ("allow policy not defined".to_string(), MSG_NO_PERMISSION.to_string())
            }
            Self::PolicyDenied { policy } => (policy.clone(), MSG_POLICY_DENIED.to_string()),
            Self::Evaluation { message } => (message.clone(), MSG_EVALUATION_FAILED.to_string()),
            Self::Context { message } => (message.clone(), MSG_INTERNAL.to_string()),
            other => (other.to_string(), MSG_INTERNAL.to_string()),
        };

        RequestError {
            status_code,
            error,
            message,
        }
    }
}

/// Wire error body, serialized bit-exact as
/// `{"statusCode": <int>, "error": <technical>, "message": <business>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    /// HTTP status code, repeated in the body.
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Technical error.
    pub error: String,
    /// Business message.
    pub message: String,
}
