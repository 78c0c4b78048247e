//! Policy evaluation using the regorus Rego engine.
//!
//! Compiling a policy per request is expensive, so a [`PolicyEvaluator`] is
//! compiled once per referenced policy at startup and cloned per request:
//! the regorus engine exposes exactly the cheap clone-with-input primitive
//! this needs. The `get_header` built-in is registered at compile time, so
//! every clone carries it.

use std::sync::Arc;
use std::time::Instant;

use regorus::Engine;
use tracing::{debug, instrument};

use crate::builtins::register_get_header;
use crate::error::{AuthzError, AuthzResult};
use crate::input::PolicyInput;
use crate::module::PolicyModule;
use crate::partial::{PartialResult, ResidualPlan, UNKNOWN_REFS};

/// Package that policy rules are queried under.
const POLICY_PACKAGE: &str = "data.policies";

/// Canonicalizes a dot-notated policy name into its rule identifier.
///
/// OpenAPI declares policies in dot notation (`very.composed.permission`);
/// the rule in the module uses underscores. The transform is bijective over
/// `[A-Za-z0-9_]` plus `.`.
#[must_use]
pub fn canonical_policy_id(policy_name: &str) -> String {
    policy_name.replace('.', "_")
}

/// A pre-compiled policy query, cloneable per request.
///
/// Both decision paths are compiled here, once: the plain boolean query and
/// the residual plan for row-filter evaluation. Per request each path only
/// clones its engine and binds input.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    /// Engine with the module loaded and built-ins registered.
    engine: Engine,
    /// Full query string (`data.policies.<rule>`).
    query: String,
    /// Policy name in its original dot notation.
    policy_name: String,
    /// Pre-compiled residual evaluation for this rule.
    residual_plan: Arc<ResidualPlan>,
}

impl PolicyEvaluator {
    /// Compiles the query for `policy_name` against `module`.
    pub fn compile(policy_name: &str, module: &PolicyModule) -> AuthzResult<Self> {
        let rule = canonical_policy_id(policy_name);

        let mut engine = Engine::new();
        engine.set_rego_v1(false);
        engine
            .add_policy(module.name.clone(), module.content.clone())
            .map_err(|e| AuthzError::ModuleCompile(e.to_string()))?;
        register_get_header(&mut engine)?;

        let residual_plan = Arc::new(ResidualPlan::compile(module, &rule, UNKNOWN_REFS)?);

        Ok(Self {
            engine,
            query: format!("{POLICY_PACKAGE}.{rule}"),
            policy_name: policy_name.to_string(),
            residual_plan,
        })
    }

    /// The policy name this evaluator answers for, in dot notation.
    #[must_use]
    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    /// Clones the compiled query and binds a fresh input to it.
    ///
    /// The clone owns its engine: mutating or dropping the input after
    /// evaluation never touches the cached evaluator.
    pub fn for_input(&self, input: &PolicyInput) -> AuthzResult<BoundEvaluator> {
        let raw = serde_json::to_value(input)
            .map_err(|e| AuthzError::InvalidInput(e.to_string()))?;
        self.for_raw_input(raw)
    }

    /// Like [`Self::for_input`], for callers that already hold the input as
    /// JSON.
    pub fn for_raw_input(&self, input: serde_json::Value) -> AuthzResult<BoundEvaluator> {
        let mut engine = self.engine.clone();
        engine.set_input(input.clone().into());

        Ok(BoundEvaluator {
            engine,
            query: self.query.clone(),
            policy_name: self.policy_name.clone(),
            residual_plan: self.residual_plan.clone(),
            input,
        })
    }
}

/// A per-request evaluator: one cloned engine, one bound input.
#[derive(Debug)]
pub struct BoundEvaluator {
    engine: Engine,
    query: String,
    policy_name: String,
    residual_plan: Arc<ResidualPlan>,
    input: serde_json::Value,
}

impl BoundEvaluator {
    /// The permission this evaluator enforces, in dot notation.
    #[must_use]
    pub fn required_permission(&self) -> &str {
        &self.policy_name
    }

    /// Evaluates the policy query to a boolean decision.
    ///
    /// A query that yields no result, or anything other than `true`, is a
    /// denial; evaluation failures are surfaced as errors, not denials.
    #[instrument(skip(self), fields(policy = %self.policy_name))]
    pub fn eval(&mut self) -> AuthzResult<bool> {
        let start = Instant::now();

        let results = self
            .engine
            .eval_query(self.query.clone(), false)
            .map_err(|e| AuthzError::evaluation(e.to_string()))?;

        let allowed = results
            .result
            .iter()
            .flat_map(|r| r.expressions.iter())
            .any(|e| matches!(e.value, regorus::Value::Bool(true)));

        debug!(
            allowed,
            elapsed_us = start.elapsed().as_micros() as u64,
            "policy evaluated"
        );

        Ok(allowed)
    }

    /// Reduces the policy to residual queries, leaving the standard unknown
    /// references (`data.resources`) unresolved.
    ///
    /// Runs against the residual plan compiled at startup; this call only
    /// clones the plan's engine and binds the request input. The residuals
    /// are handed to the collaborator that injects filter predicates into
    /// the upstream request; this core only produces them.
    pub fn partial(&self) -> AuthzResult<PartialResult> {
        self.residual_plan.evaluate(&self.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(content: &str) -> PolicyModule {
        PolicyModule::new("example.rego", content)
    }

    fn input_with_headers(headers: serde_json::Value) -> PolicyInput {
        let mut input = PolicyInput::default();
        input.request.headers = serde_json::from_value(headers).unwrap();
        input
    }

    #[test]
    fn test_canonical_policy_id() {
        assert_eq!(canonical_policy_id("foobar"), "foobar");
        assert_eq!(
            canonical_policy_id("very.very.composed.permission"),
            "very_very_composed_permission"
        );
        assert_eq!(canonical_policy_id("already_flat"), "already_flat");
    }

    #[test]
    fn test_eval_allow() {
        let evaluator =
            PolicyEvaluator::compile("foobar", &module("package policies\nfoobar { true }"))
                .unwrap();
        let mut bound = evaluator.for_input(&PolicyInput::default()).unwrap();
        assert!(bound.eval().unwrap());
        assert_eq!(bound.required_permission(), "foobar");
    }

    #[test]
    fn test_eval_deny_on_undefined_rule_body() {
        let evaluator = PolicyEvaluator::compile(
            "restricted",
            &module("package policies\nrestricted { input.clientType == \"backoffice\" }"),
        )
        .unwrap();
        let mut bound = evaluator.for_input(&PolicyInput::default()).unwrap();
        assert!(!bound.eval().unwrap());
    }

    #[test]
    fn test_composed_policy_name_resolves_underscored_rule() {
        let evaluator = PolicyEvaluator::compile(
            "very.very.composed.permission",
            &module("package policies\nvery_very_composed_permission { true }"),
        )
        .unwrap();
        assert_eq!(
            evaluator.policy_name(),
            "very.very.composed.permission"
        );

        let mut bound = evaluator.for_input(&PolicyInput::default()).unwrap();
        assert!(bound.eval().unwrap());
        // The dot form is preserved for reporting even though the query
        // used the underscore rule.
        assert_eq!(
            bound.required_permission(),
            "very.very.composed.permission"
        );
    }

    #[test]
    fn test_eval_reads_input() {
        let evaluator = PolicyEvaluator::compile(
            "needs_group",
            &module(
                "package policies\nneeds_group { input.user.groups[_] == \"admins\" }",
            ),
        )
        .unwrap();

        let mut input = PolicyInput::default();
        input.user.groups = vec!["users".to_string(), "admins".to_string()];
        assert!(evaluator.for_input(&input).unwrap().eval().unwrap());

        input.user.groups = vec!["users".to_string()];
        assert!(!evaluator.for_input(&input).unwrap().eval().unwrap());
    }

    #[test]
    fn test_get_header_policy_allow_and_partial() {
        let evaluator = PolicyEvaluator::compile(
            "todo",
            &module(
                "package policies\ntodo { get_header(\"ExAmPlEkEy\", input.request.headers) == \"value\" }",
            ),
        )
        .unwrap();

        let input = input_with_headers(serde_json::json!({"Examplekey": ["value"]}));
        let mut bound = evaluator.for_input(&input).unwrap();
        assert!(bound.eval().unwrap());
        assert_eq!(bound.partial().unwrap().queries.len(), 1);

        let input = input_with_headers(serde_json::json!({}));
        let mut bound = evaluator.for_input(&input).unwrap();
        assert!(!bound.eval().unwrap());
        assert_eq!(bound.partial().unwrap().queries.len(), 0);
    }

    #[test]
    fn test_cached_evaluator_isolated_from_request_state() {
        let evaluator = PolicyEvaluator::compile(
            "flagged",
            &module("package policies\nflagged { input.clientType == \"cli\" }"),
        )
        .unwrap();

        let mut input = PolicyInput::default();
        input.client_type = "cli".to_string();
        let mut bound = evaluator.for_input(&input).unwrap();
        assert!(bound.eval().unwrap());

        // Mutating the per-request input after evaluation must not leak
        // into the cached evaluator.
        input.client_type = "tampered".to_string();
        let mut second = evaluator.for_input(&PolicyInput::default()).unwrap();
        assert!(!second.eval().unwrap());

        let mut third = evaluator
            .for_input(&{
                let mut i = PolicyInput::default();
                i.client_type = "cli".to_string();
                i
            })
            .unwrap();
        assert!(third.eval().unwrap());
    }

    #[test]
    fn test_compile_accepts_rule_missing_from_module() {
        // Compilation binds the module, not the rule: dangling references
        // are caught by the cache builder, and evaluating one is simply a
        // denial.
        let evaluator =
            PolicyEvaluator::compile("ghost", &module("package policies\nfoobar { true }"))
                .unwrap();
        let mut bound = evaluator.for_input(&PolicyInput::default()).unwrap();
        assert!(!bound.eval().unwrap());
    }
}
