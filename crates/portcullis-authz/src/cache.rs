//! Startup-built cache of pre-compiled policy evaluators.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{AuthzError, AuthzResult};
use crate::evaluator::{canonical_policy_id, PolicyEvaluator};
use crate::module::PolicyModule;

/// One pre-compiled evaluator per policy name referenced by the route
/// table.
///
/// Built once at startup and shared read-only across request tasks; per
/// request, [`PolicyEvaluator::for_input`] produces the cheap clone that
/// actually evaluates.
#[derive(Debug, Default)]
pub struct EvaluatorCache {
    evaluators: HashMap<String, PolicyEvaluator>,
}

impl EvaluatorCache {
    /// Compiles an evaluator for every name in `policy_names`.
    ///
    /// Names are dot-notated; each must have a rule (after underscore
    /// canonicalization) in the module, otherwise the OpenAPI document
    /// references a policy that cannot exist and startup must fail.
    pub fn build(
        module: &Arc<PolicyModule>,
        policy_names: impl IntoIterator<Item = String>,
    ) -> AuthzResult<Self> {
        let rules = module.rule_names();
        let mut evaluators = HashMap::new();

        for name in policy_names {
            if evaluators.contains_key(&name) {
                continue;
            }
            let rule = canonical_policy_id(&name);
            if !rules.contains(&rule) {
                return Err(AuthzError::PolicyNotFound(name));
            }
            debug!(policy = %name, rule = %rule, "compiling policy query");
            let evaluator = PolicyEvaluator::compile(&name, module)?;
            evaluators.insert(name, evaluator);
        }

        info!(policies = evaluators.len(), "evaluator cache ready");
        Ok(Self { evaluators })
    }

    /// Returns the cached evaluator for a dot-notated policy name.
    pub fn get(&self, policy_name: &str) -> AuthzResult<&PolicyEvaluator> {
        self.evaluators
            .get(policy_name)
            .ok_or_else(|| AuthzError::PolicyNotFound(policy_name.to_string()))
    }

    /// Number of cached evaluators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    /// True when the cache holds no evaluators.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::PolicyInput;

    fn module() -> Arc<PolicyModule> {
        Arc::new(PolicyModule::new(
            "example.rego",
            concat!(
                "package policies\n",
                "foobar { true }\n",
                "very_very_composed_permission { true }\n",
            ),
        ))
    }

    #[test]
    fn test_build_and_get() {
        let cache = EvaluatorCache::build(
            &module(),
            vec![
                "foobar".to_string(),
                "very.very.composed.permission".to_string(),
            ],
        )
        .unwrap();

        assert_eq!(cache.len(), 2);
        let evaluator = cache.get("very.very.composed.permission").unwrap();
        let mut bound = evaluator.for_input(&PolicyInput::default()).unwrap();
        assert!(bound.eval().unwrap());
    }

    #[test]
    fn test_dangling_reference_fails_build() {
        let err = EvaluatorCache::build(&module(), vec!["ghost.policy".to_string()]).unwrap_err();
        assert!(err.is_policy_not_found());
        assert!(err.to_string().contains("ghost.policy"));
    }

    #[test]
    fn test_unknown_name_at_lookup() {
        let cache = EvaluatorCache::build(&module(), vec!["foobar".to_string()]).unwrap();
        assert!(cache.get("other").unwrap_err().is_policy_not_found());
    }

    #[test]
    fn test_duplicate_names_compile_once() {
        let cache = EvaluatorCache::build(
            &module(),
            vec!["foobar".to_string(), "foobar".to_string()],
        )
        .unwrap();
        assert_eq!(cache.len(), 1);
    }
}
