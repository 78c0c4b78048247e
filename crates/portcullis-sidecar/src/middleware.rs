//! The policy middleware: request-time orchestration.
//!
//! Per request the middleware walks a strict pipeline:
//! route lookup → context enrichment → input building → policy evaluation,
//! ending in either an enriched [`RequestContext`] ready for proxying or a
//! [`SidecarError`] that maps to the structured denial body.
//!
//! Everything the middleware reads (route table, evaluator cache, policy
//! module, environment) was built at startup and is shared immutably; the
//! per-request state lives in the returned context.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::{HeaderMap, Method, Uri};
use portcullis_authz::{
    canonical_header_key, EvaluatorCache, InputRequest, InputUser, PolicyInput, PolicyModule,
    UserBindingsProvider,
};
use portcullis_router::RouteTable;
use tracing::{debug, error, warn};

use crate::config::Environment;
use crate::context::{Caller, RequestContext, RouterInfo};
use crate::error::{SidecarError, SidecarResult};

/// The request-time policy enforcement pipeline.
#[derive(Clone)]
pub struct PolicyMiddleware {
    env: Arc<Environment>,
    module: Arc<PolicyModule>,
    routes: Arc<RouteTable>,
    evaluators: Arc<EvaluatorCache>,
    bindings: Option<Arc<dyn UserBindingsProvider>>,
}

impl PolicyMiddleware {
    /// Creates the middleware over startup-built shared state.
    pub fn new(
        env: Arc<Environment>,
        module: Arc<PolicyModule>,
        routes: Arc<RouteTable>,
        evaluators: Arc<EvaluatorCache>,
    ) -> Self {
        Self {
            env,
            module,
            routes,
            evaluators,
            bindings: None,
        }
    }

    /// Installs the external bindings/roles collaborator.
    #[must_use]
    pub fn with_bindings_provider(mut self, provider: Arc<dyn UserBindingsProvider>) -> Self {
        self.bindings = Some(provider);
        self
    }

    /// Runs the pipeline for one request.
    ///
    /// `Ok` means the request is cleared for proxying and carries the
    /// enriched context; `Err` maps to the denial response.
    pub fn authorize(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> SidecarResult<RequestContext> {
        let requested_path = uri.path().to_string();

        // Standalone deployments expose the routes under a shared prefix;
        // only the first occurrence is stripped.
        let routed_path = if self.env.standalone {
            requested_path.replacen(&self.env.path_prefix_standalone, "", 1)
        } else {
            requested_path.clone()
        };

        let mut ctx = RequestContext::new();
        ctx.set_environment(self.env.clone());
        ctx.set_policy_module(self.module.clone());

        // Documentation passthrough: the OAS path is forwarded untouched,
        // whether or not the document declares it.
        if self
            .env
            .target_service_oas_path
            .as_deref()
            .is_some_and(|oas| oas == routed_path)
        {
            debug!(path = %routed_path, "documentation passthrough");
            ctx.set_router_info(RouterInfo {
                matched_path: String::new(),
                requested_path,
                method: method.to_string(),
            });
            return Ok(ctx);
        }

        let Some(matched) = self.routes.lookup(method, &routed_path) else {
            return Err(SidecarError::route_not_found(method.as_str(), &routed_path));
        };

        let config = matched.config.clone();
        if config.request_flow.policy_name.is_empty() {
            warn!(method = %method, path = %routed_path, "route declares no policy");
            return Err(SidecarError::missing_permission(method.as_str(), &routed_path));
        }

        ctx.set_router_info(RouterInfo {
            matched_path: matched.matched_path.to_string(),
            requested_path,
            method: method.to_string(),
        });

        let caller = decode_caller(&self.env, headers);
        let policy_name = config.request_flow.policy_name.clone();

        // Prefix routes without variables keep the (stripped) raw path so
        // policies can still discriminate below the prefix; template routes
        // get the stable template.
        let input_path = if matched.prefix && matched.params.is_empty() {
            routed_path.clone()
        } else {
            matched.matched_path.to_string()
        };

        let input = self.build_input(
            method,
            input_path,
            uri,
            headers,
            matched.params.to_map(),
            &caller,
        )?;

        let evaluator = self
            .evaluators
            .get(&policy_name)
            .map_err(|e| SidecarError::evaluation(e.to_string()))?;
        let mut bound = evaluator
            .for_input(&input)
            .map_err(|e| SidecarError::evaluation(e.to_string()))?;

        if config.request_flow.row_filter_enabled {
            // Row-filter policies reference data that only exists upstream,
            // so a plain evaluation is undefined for them. The decision is
            // the residual itself: no surviving query means deny.
            let residual = bound.partial().map_err(|e| {
                error!(
                    policy = %policy_name,
                    matched_path = %matched.matched_path,
                    error = %e,
                    "residual evaluation failed"
                );
                SidecarError::evaluation(e.to_string())
            })?;
            if residual.is_denied() {
                debug!(policy = %policy_name, path = %routed_path, "request denied");
                return Err(SidecarError::policy_denied(policy_name));
            }
            debug!(
                policy = %policy_name,
                queries = residual.queries.len(),
                "row-filter residual produced"
            );
            ctx.set_row_filter_residual(residual);
        } else {
            let allowed = bound.eval().map_err(|e| {
                error!(
                    policy = %policy_name,
                    matched_path = %matched.matched_path,
                    error = %e,
                    "policy evaluation failed"
                );
                SidecarError::evaluation(e.to_string())
            })?;
            if !allowed {
                debug!(policy = %policy_name, path = %routed_path, "request denied");
                return Err(SidecarError::policy_denied(policy_name));
            }
        }

        ctx.set_rond_config(config);
        ctx.set_caller(caller);
        Ok(ctx)
    }

    /// Assembles the policy input from the request and the decoded caller.
    fn build_input(
        &self,
        method: &Method,
        path: String,
        uri: &Uri,
        headers: &HeaderMap,
        path_params: BTreeMap<String, String>,
        caller: &Caller,
    ) -> SidecarResult<PolicyInput> {
        let (bindings, roles) = match &self.bindings {
            Some(provider) => {
                let grants = provider
                    .grants_for(&caller.groups, &caller.properties)
                    .map_err(|e| SidecarError::evaluation(e.to_string()))?;
                (grants.bindings, grants.roles)
            }
            None => (Vec::new(), Vec::new()),
        };

        Ok(PolicyInput {
            request: InputRequest {
                method: method.as_str().to_uppercase(),
                path,
                headers: canonical_headers(headers),
                query: parse_query(uri.query()),
                path_params,
            },
            user: InputUser {
                properties: caller.properties.clone(),
                groups: caller.groups.clone(),
                bindings,
                roles,
            },
            client_type: caller.client_type.clone(),
        })
    }
}

/// Decodes the caller identity headers.
///
/// Invalid JSON in the properties header degrades to `{}` rather than
/// failing the request: the policy decides what to do with an anonymous
/// caller.
fn decode_caller(env: &Environment, headers: &HeaderMap) -> Caller {
    let properties = header_value(headers, &env.user_properties_header_key)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .filter(serde_json::Value::is_object)
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

    let groups = header_value(headers, &env.user_groups_header_key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let client_type = header_value(headers, &env.client_type_header_key).unwrap_or_default();

    Caller {
        properties,
        groups,
        client_type,
    }
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Canonical header name → ordered values.
fn canonical_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in headers.keys() {
        let canonical = canonical_header_key(key.as_str());
        let values = out.entry(canonical).or_default();
        for value in headers.get_all(key) {
            if let Ok(v) = value.to_str() {
                values.push(v.to_string());
            }
        }
    }
    out
}

/// Query key → ordered values.
fn parse_query(query: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let Some(query) = query else {
        return out;
    };
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(query).unwrap_or_default();
    for (key, value) in pairs {
        out.entry(key).or_default().push(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use portcullis_authz::{AuthzResult, UserGrants};
    use portcullis_router::OpenApiSpec;

    fn environment(vars: &[(&str, &str)]) -> Arc<Environment> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Arc::new(
            Environment::from_lookup(|key| {
                vars.iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .or_else(|| match key {
                        "TARGET_SERVICE_HOST" => Some("localhost:3000".to_string()),
                        "OPA_MODULES_DIRECTORY" => Some("/policies".to_string()),
                        _ => None,
                    })
            })
            .unwrap(),
        )
    }

    fn simplified_spec() -> OpenApiSpec {
        OpenApiSpec::from_json(
            br#"{"paths": {
                "/users/": {"get": {"x-permission": {"allow": "todo"}}},
                "/composed/permission/": {
                    "get": {"x-permission": {"allow": "very.very.composed.permission"}}
                },
                "/no-permission": {"post": {}}
            }}"#,
        )
        .unwrap()
    }

    fn middleware_with(
        env: Arc<Environment>,
        module_content: &str,
        spec: &OpenApiSpec,
    ) -> PolicyMiddleware {
        let module = Arc::new(PolicyModule::new("example.rego", module_content));
        let routes = Arc::new(RouteTable::from_spec(spec).unwrap());
        let evaluators =
            Arc::new(EvaluatorCache::build(&module, routes.policy_names()).unwrap());
        PolicyMiddleware::new(env, module, routes, evaluators)
    }

    fn uri(path_and_query: &str) -> Uri {
        path_and_query.parse().unwrap()
    }

    #[test]
    fn test_unknown_route_is_not_found() {
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { true }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let err = mw
            .authorize(&Method::GET, &uri("/not-existing-path"), &HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.status_code(), 404);

        let body = err.to_request_error();
        assert_eq!(
            body.error,
            "not found oas definition: GET /not-existing-path"
        );
        assert_eq!(body.message, "The request doesn't match any known API");
    }

    #[test]
    fn test_unknown_method_on_known_path_is_not_found() {
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { true }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let err = mw
            .authorize(&Method::DELETE, &uri("/users/"), &HeaderMap::new())
            .unwrap_err();
        let body = err.to_request_error();
        assert_eq!(body.status_code, 404);
        assert_eq!(body.error, "not found oas definition: DELETE /users/");
    }

    #[test]
    fn test_missing_permission_is_forbidden() {
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { true }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let err = mw
            .authorize(&Method::POST, &uri("/no-permission"), &HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_allow_enriches_context() {
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { true }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let ctx = mw
            .authorize(&Method::GET, &uri("/users/"), &HeaderMap::new())
            .unwrap();

        let config = ctx.rond_config().unwrap();
        assert_eq!(config.request_flow.policy_name, "todo");

        let info = ctx.router_info().unwrap();
        assert_eq!(info.matched_path, "/users/");
        assert_eq!(info.requested_path, "/users/");
        assert_eq!(info.method, "GET");

        assert!(ctx.environment().is_ok());
        assert!(ctx.policy_module().is_ok());
    }

    #[test]
    fn test_composed_permission_keeps_dot_form_in_context() {
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { true }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let ctx = mw
            .authorize(&Method::GET, &uri("/composed/permission/"), &HeaderMap::new())
            .unwrap();
        assert_eq!(
            ctx.rond_config().unwrap().request_flow.policy_name,
            "very.very.composed.permission"
        );
    }

    #[test]
    fn test_deny_names_the_policy() {
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { false }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let err = mw
            .authorize(&Method::GET, &uri("/users/"), &HeaderMap::new())
            .unwrap_err();
        let body = err.to_request_error();
        assert_eq!(body.status_code, 403);
        assert_eq!(body.error, "todo");
        assert_eq!(body.message, "RBAC policy evaluation failed");
    }

    #[test]
    fn test_documentation_passthrough_without_declaration() {
        let mw = middleware_with(
            environment(&[("TARGET_SERVICE_OAS_PATH", "/documentation/json")]),
            "package policies\ntodo { true }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let ctx = mw
            .authorize(&Method::GET, &uri("/documentation/json"), &HeaderMap::new())
            .unwrap();

        let info = ctx.router_info().unwrap();
        assert_eq!(info.matched_path, "");
        assert_eq!(info.requested_path, "/documentation/json");
        // No policy was evaluated, so no rond config is attached.
        assert!(ctx.rond_config().is_err());
    }

    #[test]
    fn test_standalone_strips_one_prefix() {
        let mw = middleware_with(
            environment(&[("STANDALONE", "true")]),
            "package policies\ntodo { true }\nvery_very_composed_permission { true }",
            &simplified_spec(),
        );

        let ctx = mw
            .authorize(
                &Method::GET,
                &uri("/eval/composed/permission/"),
                &HeaderMap::new(),
            )
            .unwrap();
        assert_eq!(
            ctx.rond_config().unwrap().request_flow.policy_name,
            "very.very.composed.permission"
        );
        assert_eq!(
            ctx.router_info().unwrap().requested_path,
            "/eval/composed/permission/"
        );
    }

    #[test]
    fn test_standalone_strips_only_first_occurrence() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {
                "/eval/composed/permission/": {
                    "get": {"x-permission": {"allow": "very.very.composed.permission.with.eval"}}
                }
            }}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[("STANDALONE", "true")]),
            "package policies\nvery_very_composed_permission_with_eval { true }",
            &spec,
        );

        // /eval/eval/... routes to /eval/... after stripping exactly once.
        let ctx = mw
            .authorize(
                &Method::GET,
                &uri("/eval/eval/composed/permission/"),
                &HeaderMap::new(),
            )
            .unwrap();
        assert_eq!(
            ctx.rond_config().unwrap().request_flow.policy_name,
            "very.very.composed.permission.with.eval"
        );
    }

    #[test]
    fn test_get_header_policy_sees_canonical_headers() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/users/": {"get": {"x-permission": {"allow": "todo"}}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { get_header(\"ExAmPlEkEy\", input.request.headers) == \"value\" }",
            &spec,
        );

        let mut headers = HeaderMap::new();
        headers.insert("examplekey", HeaderValue::from_static("value"));
        assert!(mw.authorize(&Method::GET, &uri("/users/"), &headers).is_ok());

        let err = mw
            .authorize(&Method::GET, &uri("/users/"), &HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_input_carries_groups_and_client_type() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/users/": {"get": {"x-permission": {"allow": "todo"}}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            concat!(
                "package policies\n",
                "todo {\n",
                "  input.user.groups[_] == \"admins\"\n",
                "  input.clientType == \"frontend\"\n",
                "}",
            ),
            &spec,
        );

        let mut headers = HeaderMap::new();
        headers.insert("miausergroups", HeaderValue::from_static("users, admins"));
        headers.insert("Client-Type", HeaderValue::from_static("frontend"));
        assert!(mw.authorize(&Method::GET, &uri("/users/"), &headers).is_ok());

        headers.remove("miausergroups");
        assert!(mw.authorize(&Method::GET, &uri("/users/"), &headers).is_err());
    }

    #[test]
    fn test_invalid_user_properties_degrade_to_empty_object() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/users/": {"get": {"x-permission": {"allow": "todo"}}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { count(input.user.properties) == 0 }",
            &spec,
        );

        let mut headers = HeaderMap::new();
        headers.insert("miauserproperties", HeaderValue::from_static("{not json"));
        assert!(mw.authorize(&Method::GET, &uri("/users/"), &headers).is_ok());
    }

    #[test]
    fn test_template_path_and_params_in_input() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/users/{id}": {"get": {"x-permission": {"allow": "todo"}}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            concat!(
                "package policies\n",
                "todo {\n",
                "  input.request.path == \"/users/{id}\"\n",
                "  input.request.pathParams.id == \"42\"\n",
                "  input.request.query.page[0] == \"3\"\n",
                "}",
            ),
            &spec,
        );

        assert!(mw
            .authorize(&Method::GET, &uri("/users/42?page=3"), &HeaderMap::new())
            .is_ok());
    }

    #[test]
    fn test_prefix_route_input_uses_raw_path() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/assets/*": {"get": {"x-permission": {"allow": "assets.read"}}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            "package policies\nassets_read { input.request.path == \"/assets/logo.png\" }",
            &spec,
        );

        assert!(mw
            .authorize(&Method::GET, &uri("/assets/logo.png"), &HeaderMap::new())
            .is_ok());
    }

    #[test]
    fn test_row_filter_route_attaches_residual() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/projects/": {"get": {"x-permission": {
                "allow": "projects.view",
                "resourceFilter": {"rowFilter": {"enabled": true}}
            }}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            concat!(
                "package policies\n",
                "projects_view {\n",
                "  input.request.method == \"GET\"\n",
                "  row := data.resources[_]\n",
                "  row.tenant == \"acme\"\n",
                "}",
            ),
            &spec,
        );

        let ctx = mw
            .authorize(&Method::GET, &uri("/projects/"), &HeaderMap::new())
            .unwrap();
        let residual = ctx.row_filter_residual().unwrap();
        assert_eq!(residual.queries.len(), 1);
        assert_eq!(residual.queries[0].exprs.len(), 2);
    }

    struct StaticGrants;

    impl UserBindingsProvider for StaticGrants {
        fn grants_for(
            &self,
            _groups: &[String],
            _properties: &serde_json::Value,
        ) -> AuthzResult<UserGrants> {
            Ok(UserGrants {
                bindings: vec![serde_json::json!({"resource": "project-1"})],
                roles: vec![serde_json::json!({"roleId": "editor"})],
            })
        }
    }

    #[test]
    fn test_bindings_provider_feeds_input() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/users/": {"get": {"x-permission": {"allow": "todo"}}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            "package policies\ntodo { input.user.roles[_].roleId == \"editor\" }",
            &spec,
        )
        .with_bindings_provider(Arc::new(StaticGrants));

        assert!(mw
            .authorize(&Method::GET, &uri("/users/"), &HeaderMap::new())
            .is_ok());
    }

    #[test]
    fn test_row_filter_denied_when_known_part_fails() {
        let spec = OpenApiSpec::from_json(
            br#"{"paths": {"/projects/": {"post": {"x-permission": {
                "allow": "projects.view",
                "resourceFilter": {"rowFilter": {"enabled": true}}
            }}}}}"#,
        )
        .unwrap();
        let mw = middleware_with(
            environment(&[]),
            concat!(
                "package policies\n",
                "projects_view {\n",
                "  input.request.method == \"GET\"\n",
                "  row := data.resources[_]\n",
                "}",
            ),
            &spec,
        );

        let err = mw
            .authorize(&Method::POST, &uri("/projects/"), &HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }
}
