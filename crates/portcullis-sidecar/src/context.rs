//! Request-scoped context carrier.
//!
//! Each request travels with a typed bundle: the environment, the policy
//! module, the matched router info, the route's `RondConfig`, and the
//! decoded caller. The carrier is a TypeId-keyed map with named accessors;
//! a failed lookup is an error naming the missing piece, never a silently
//! default-constructed value. There are no process-wide globals.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use portcullis_authz::PolicyModule;
use portcullis_router::RondConfig;

use crate::config::Environment;
use crate::error::{SidecarError, SidecarResult};

/// Routing facts attached to every matched request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterInfo {
    /// Template that matched; empty for documentation passthrough.
    pub matched_path: String,
    /// Path as the client requested it (before prefix stripping).
    pub requested_path: String,
    /// Uppercase HTTP verb.
    pub method: String,
}

/// The caller, as decoded from the identity headers.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// Parsed JSON user properties; `{}` when absent or invalid.
    pub properties: serde_json::Value,
    /// Comma-split group list.
    pub groups: Vec<String>,
    /// Client type header value, or empty.
    pub client_type: String,
}

/// Typed request-scoped key-value carrier.
#[derive(Debug, Default)]
pub struct RequestContext {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a typed value, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a typed value.
    fn get<T: Send + Sync + 'static>(&self, what: &str) -> SidecarResult<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
            .ok_or_else(|| SidecarError::context(format!("no {what} found in context")))
    }

    /// Attaches the environment.
    pub fn set_environment(&mut self, env: Arc<Environment>) {
        self.insert(env);
    }

    /// The environment, or a context error.
    pub fn environment(&self) -> SidecarResult<&Arc<Environment>> {
        self.get("environment")
    }

    /// Attaches the policy module.
    pub fn set_policy_module(&mut self, module: Arc<PolicyModule>) {
        self.insert(module);
    }

    /// The policy module, or a context error.
    pub fn policy_module(&self) -> SidecarResult<&Arc<PolicyModule>> {
        self.get("policy module")
    }

    /// Attaches the router info.
    pub fn set_router_info(&mut self, info: RouterInfo) {
        self.insert(info);
    }

    /// The router info, or a context error.
    pub fn router_info(&self) -> SidecarResult<&RouterInfo> {
        self.get("router info")
    }

    /// Attaches the matched route's configuration.
    pub fn set_rond_config(&mut self, config: RondConfig) {
        self.insert(config);
    }

    /// The matched route's configuration, or a context error.
    pub fn rond_config(&self) -> SidecarResult<&RondConfig> {
        self.get("rond config")
    }

    /// Attaches the decoded caller.
    pub fn set_caller(&mut self, caller: Caller) {
        self.insert(caller);
    }

    /// The decoded caller, or a context error.
    pub fn caller(&self) -> SidecarResult<&Caller> {
        self.get("caller")
    }

    /// Attaches the residual queries of a row-filter evaluation.
    pub fn set_row_filter_residual(&mut self, residual: portcullis_authz::PartialResult) {
        self.insert(residual);
    }

    /// Residual queries, when the matched route is a row-filter route.
    ///
    /// Unlike the other accessors this returns an `Option`: most routes
    /// never produce residuals.
    #[must_use]
    pub fn row_filter_residual(&self) -> Option<&portcullis_authz::PartialResult> {
        self.values
            .get(&TypeId::of::<portcullis_authz::PartialResult>())
            .and_then(|v| v.downcast_ref())
    }
}
