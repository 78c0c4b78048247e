//! Error types for route-table construction.

use thiserror::Error;

/// Result type for route-table operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors raised while building a [`crate::RouteTable`].
///
/// All of these are startup errors: a table that builds successfully never
/// fails at lookup time.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouterError {
    /// The OpenAPI document could not be interpreted.
    #[error("invalid OpenAPI document: {0}")]
    InvalidSpec(String),

    /// Two operations registered the same method on the same template.
    #[error("ambiguous route registration: {method} {template}")]
    AmbiguousRoute {
        /// HTTP method of the duplicate registration.
        method: String,
        /// Path template of the duplicate registration.
        template: String,
    },

    /// A `/*` capture appeared before the end of a template.
    #[error("prefix capture must terminate the template: {0}")]
    PrefixPosition(String),

    /// An operation used an HTTP method the table cannot route.
    #[error("unsupported method {method} on {template}")]
    UnsupportedMethod {
        /// The offending method key.
        method: String,
        /// Path template it was registered on.
        template: String,
    },

    /// JSON deserialization error from the OpenAPI source.
    #[error("OpenAPI JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RouterError {
    /// Create an invalid-spec error.
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec(message.into())
    }

    /// Create an ambiguous-route error.
    pub fn ambiguous(method: impl Into<String>, template: impl Into<String>) -> Self {
        Self::AmbiguousRoute {
            method: method.into(),
            template: template.into(),
        }
    }
}
