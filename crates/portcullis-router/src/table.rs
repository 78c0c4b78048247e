//! The route table: OpenAPI document → immutable permission lookup.

use std::collections::BTreeSet;

use http::Method;

use crate::error::RouterResult;
use crate::node::Node;
use crate::oas::{OpenApiSpec, RondConfig};
use crate::params::PathParams;

/// Immutable mapping from `(method, path)` to the route's authorization
/// configuration.
///
/// Built once at startup from an [`OpenApiSpec`] and shared read-only across
/// request tasks. Construction fails on ambiguous registrations; lookup is
/// deterministic thereafter.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    root: Node,
    route_count: usize,
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    /// Authorization configuration of the matched operation.
    pub config: &'a RondConfig,
    /// The template that matched, exactly as declared in the document.
    pub matched_path: &'a str,
    /// Captures for the template's `{name}` segments.
    pub params: PathParams,
    /// True when the match came from a `/*` prefix route.
    pub prefix: bool,
}

impl RouteTable {
    /// Builds the table from an OpenAPI document.
    ///
    /// Every operation registers under its template; operations without an
    /// `x-permission` extension register with an empty policy name so the
    /// middleware can answer 403 instead of 404 for them. Duplicate
    /// `(template, method)` pairs are a startup error.
    pub fn from_spec(spec: &OpenApiSpec) -> RouterResult<Self> {
        let mut table = Self::default();

        for (template, item) in &spec.paths {
            for (method, operation) in item.operations()? {
                let config = operation
                    .permission
                    .as_ref()
                    .map(RondConfig::from)
                    .unwrap_or_default();
                table.root.insert(template, method, config)?;
                table.route_count += 1;
            }
        }

        Ok(table)
    }

    /// Looks up the configuration guarding `(method, path)`.
    ///
    /// Returns `None` when no template matches the path, or when a template
    /// matches but declares nothing for the method.
    #[must_use]
    pub fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let (route, params) = self.root.match_path(path)?;
        let config = route.methods.get(method)?;
        Some(RouteMatch {
            config,
            matched_path: &route.template,
            params,
            prefix: route.prefix,
        })
    }

    /// All policy names referenced by the table (request and response
    /// flows), in dot notation, deduplicated.
    #[must_use]
    pub fn policy_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.root.visit_routes(&mut |route| {
            for config in route.methods.configs() {
                names.extend(config.policy_names().map(String::from));
            }
        });
        names
    }

    /// Number of registered `(template, method)` operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.route_count
    }

    /// True when the table holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }
}
