//! OpenAPI document types and the `x-permission` extension.
//!
//! Only the slice of OpenAPI that matters to authorization is modeled:
//! `paths`, the method keys under each path, and the `x-permission`
//! extension on each operation. Everything else in the document is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

/// HTTP method keys recognized inside a path item.
const METHOD_KEYS: &[&str] = &[
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// An OpenAPI document, reduced to its authorization-relevant parts.
///
/// `paths` is a sorted map so table construction walks the document in a
/// deterministic order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenApiSpec {
    /// Path template → path item.
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
}

impl OpenApiSpec {
    /// Parses a document from raw JSON.
    pub fn from_json(raw: &[u8]) -> RouterResult<Self> {
        let spec: Self = serde_json::from_slice(raw)?;
        if spec.paths.is_empty() {
            return Err(RouterError::invalid_spec("document declares no paths"));
        }
        Ok(spec)
    }
}

/// A single path entry: everything keyed under one template.
///
/// OpenAPI mixes operations with non-operation keys (`parameters`,
/// `summary`, …) at this level, so the raw values are kept and only the
/// method keys are interpreted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathItem(pub BTreeMap<String, serde_json::Value>);

impl PathItem {
    /// Iterates over the `(METHOD, operation)` pairs of this path item,
    /// skipping non-method keys.
    pub fn operations(&self) -> RouterResult<Vec<(http::Method, Operation)>> {
        let mut out = Vec::new();
        for (key, value) in &self.0 {
            let lower = key.to_ascii_lowercase();
            if !METHOD_KEYS.contains(&lower.as_str()) {
                continue;
            }
            let method = http::Method::from_bytes(lower.to_ascii_uppercase().as_bytes())
                .map_err(|_| RouterError::UnsupportedMethod {
                    method: key.clone(),
                    template: String::new(),
                })?;
            let operation: Operation = serde_json::from_value(value.clone())?;
            out.push((method, operation));
        }
        Ok(out)
    }
}

/// An OpenAPI operation, reduced to its `x-permission` extension.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    /// The authorization extension, absent when the route declares no
    /// permission.
    #[serde(rename = "x-permission")]
    pub permission: Option<XPermission>,
}

/// Wire form of the `x-permission` extension.
///
/// ```json
/// { "x-permission": {
///     "allow": "policy.name",
///     "resourceFilter": { "rowFilter": { "enabled": true } },
///     "responseFilter": { "policy": "other_policy" } } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct XPermission {
    /// Dot-notated name of the request-flow policy.
    #[serde(default)]
    pub allow: String,
    /// Row-filter configuration for partial evaluation.
    #[serde(default, rename = "resourceFilter")]
    pub resource_filter: Option<ResourceFilter>,
    /// Response-flow policy configuration.
    #[serde(default, rename = "responseFilter")]
    pub response_filter: Option<ResponseFilter>,
}

/// `resourceFilter` block of the extension.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceFilter {
    /// Row-filter toggle.
    #[serde(default, rename = "rowFilter")]
    pub row_filter: Option<RowFilter>,
}

/// `rowFilter` block of the extension.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowFilter {
    /// Whether residual queries should be produced for this route.
    #[serde(default)]
    pub enabled: bool,
}

/// `responseFilter` block of the extension.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseFilter {
    /// Dot-notated name of the response-flow policy.
    #[serde(default)]
    pub policy: String,
}

/// Per-route authorization configuration, as carried through the request
/// context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RondConfig {
    /// Request-flow configuration; its policy gates the proxying decision.
    pub request_flow: RequestFlow,
    /// Response-flow configuration, when the route filters responses.
    pub response_flow: Option<ResponseFlow>,
}

impl RondConfig {
    /// Policy names referenced by this config (request flow first), in dot
    /// notation, skipping empty names.
    pub fn policy_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.request_flow.policy_name.as_str())
            .chain(
                self.response_flow
                    .as_ref()
                    .map(|f| f.policy_name.as_str()),
            )
            .filter(|name| !name.is_empty())
    }
}

impl From<&XPermission> for RondConfig {
    fn from(ext: &XPermission) -> Self {
        let row_filter_enabled = ext
            .resource_filter
            .as_ref()
            .and_then(|f| f.row_filter.as_ref())
            .is_some_and(|f| f.enabled);

        let response_flow = ext
            .response_filter
            .as_ref()
            .filter(|f| !f.policy.is_empty())
            .map(|f| ResponseFlow {
                policy_name: f.policy.clone(),
            });

        Self {
            request_flow: RequestFlow {
                policy_name: ext.allow.clone(),
                row_filter_enabled,
            },
            response_flow,
        }
    }
}

/// Request-flow slice of a [`RondConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestFlow {
    /// Dot-notated policy name; empty when the route declared no
    /// permission.
    pub policy_name: String,
    /// Whether the policy may reference unknown resource data and should be
    /// partially evaluated into residual queries.
    pub row_filter_enabled: bool,
}

/// Response-flow slice of a [`RondConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseFlow {
    /// Dot-notated policy name.
    pub policy_name: String,
}
