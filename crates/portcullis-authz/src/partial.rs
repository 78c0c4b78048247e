//! Residual ("partial") evaluation.
//!
//! Row-filter policies reference data that is not known at request time:
//! the `data.resources` collection, whose rows only exist upstream. Partial
//! evaluation reduces such a policy to *residual queries*: the expressions
//! that could not be resolved, one query per rule body whose resolvable
//! part held.
//!
//! The engine has no native partial-evaluation mode, so residuals are
//! computed structurally. Everything that depends only on the module source
//! happens once, at startup, inside `ResidualPlan::compile`: each body of
//! the queried rule is split into expressions, the expressions that mention
//! an unknown reference (or a variable tainted by one) are held back as the
//! residual, and the remaining expressions are rewritten into synthetic
//! probe rules appended to the `policies` package and compiled alongside
//! it. Per request, `ResidualPlan::evaluate` clones the compiled engine,
//! binds the input, and probes each body.
//!
//! Observable contract:
//! - a body with no unknown references contributes one *empty* residual
//!   query when it evaluates to true, and nothing when it does not;
//! - a body with unknown references contributes its unknown expressions
//!   when the known remainder holds.

use regorus::Engine;
use tracing::debug;

use crate::builtins::register_get_header;
use crate::error::{AuthzError, AuthzResult};
use crate::module::PolicyModule;

/// References treated as unknown during residual evaluation.
pub const UNKNOWN_REFS: &[&str] = &["data.resources"];

/// One residual query: the conjunction of expressions left unresolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResidualQuery {
    /// Unresolved expressions, in source order. Empty means the query is
    /// trivially satisfied.
    pub exprs: Vec<String>,
}

/// Outcome of residual evaluation: zero or more residual queries.
///
/// Zero queries means the policy cannot be satisfied for this input.
#[derive(Debug, Clone, Default)]
pub struct PartialResult {
    /// The residual queries.
    pub queries: Vec<ResidualQuery>,
}

impl PartialResult {
    /// True when no residual query survived, i.e. the policy denies.
    #[must_use]
    pub fn is_denied(&self) -> bool {
        self.queries.is_empty()
    }
}

const PROBE_RULE_PREFIX: &str = "residual_probe_";

/// A policy's residual evaluation, compiled once at startup.
///
/// Holds its own engine with the module and the synthetic probe rules
/// already loaded and `get_header` registered; per request the engine is
/// cheaply cloned to bind fresh input, the same way the plain evaluation
/// path works.
#[derive(Debug)]
pub(crate) struct ResidualPlan {
    /// Engine with the module (and probe rules, when used) compiled.
    engine: Engine,
    /// How this plan decides.
    strategy: PlanStrategy,
    /// Full query for the original rule (`data.policies.<rule>`).
    query: String,
    /// Rule identifier, for logging.
    rule: String,
}

#[derive(Debug)]
enum PlanStrategy {
    /// One split per rule body; known parts are probed through the
    /// synthetic rules compiled into the engine.
    Probes(Vec<BodySplit>),
    /// The rule head was not recognized (value-style rule, function, or an
    /// expression shape the probe rewrite cannot express): a plain
    /// evaluation of the rule decides, with an empty residual.
    Boolean,
}

impl ResidualPlan {
    /// Splits the rule's bodies and compiles the probe rules for them.
    pub(crate) fn compile(
        module: &PolicyModule,
        rule: &str,
        unknowns: &[&str],
    ) -> AuthzResult<Self> {
        let query = format!("data.policies.{rule}");

        let bodies = rule_bodies(&module.content, rule);
        if bodies.is_empty() {
            return Ok(Self {
                engine: module_engine(module)?,
                strategy: PlanStrategy::Boolean,
                query,
                rule: rule.to_string(),
            });
        }

        let splits: Vec<BodySplit> = bodies
            .iter()
            .map(|body| split_body(body, unknowns))
            .collect();

        let mut probe_source = String::from("package policies\n");
        for (index, split) in splits.iter().enumerate() {
            if split.known.is_empty() {
                continue;
            }
            probe_source.push_str(&format!("\n{PROBE_RULE_PREFIX}{index} {{\n"));
            for expr in &split.known {
                probe_source.push_str("  ");
                probe_source.push_str(expr);
                probe_source.push('\n');
            }
            probe_source.push_str("}\n");
        }

        let mut engine = module_engine(module)?;
        if engine
            .add_policy("residual_probe.rego".to_string(), probe_source)
            .is_err()
        {
            // The probe rewrite produced something the engine rejects (odd
            // expression shapes survive splitting); fall back to a plain
            // evaluation of the original rule, on a clean engine.
            return Ok(Self {
                engine: module_engine(module)?,
                strategy: PlanStrategy::Boolean,
                query,
                rule: rule.to_string(),
            });
        }

        Ok(Self {
            engine,
            strategy: PlanStrategy::Probes(splits),
            query,
            rule: rule.to_string(),
        })
    }

    /// Evaluates the residual queries for one request's input.
    ///
    /// Clones the compiled engine and binds `input`; nothing here touches
    /// the cached plan.
    pub(crate) fn evaluate(&self, input: &serde_json::Value) -> AuthzResult<PartialResult> {
        let mut engine = self.engine.clone();
        engine.set_input(input.clone().into());

        let queries = match &self.strategy {
            PlanStrategy::Boolean => {
                if query_holds(&mut engine, self.query.clone())? {
                    vec![ResidualQuery::default()]
                } else {
                    Vec::new()
                }
            }
            PlanStrategy::Probes(splits) => {
                let mut queries = Vec::new();
                for (index, split) in splits.iter().enumerate() {
                    let satisfied = split.known.is_empty()
                        || query_holds(
                            &mut engine,
                            format!("data.policies.{PROBE_RULE_PREFIX}{index}"),
                        )?;
                    if satisfied {
                        queries.push(ResidualQuery {
                            exprs: split.residual.clone(),
                        });
                    }
                }
                queries
            }
        };

        debug!(rule = %self.rule, queries = queries.len(), "residual evaluation complete");
        Ok(PartialResult { queries })
    }
}

/// Compiles the module into a fresh engine with `get_header` registered.
fn module_engine(module: &PolicyModule) -> AuthzResult<Engine> {
    let mut engine = Engine::new();
    engine.set_rego_v1(false);
    engine
        .add_policy(module.name.clone(), module.content.clone())
        .map_err(|e| AuthzError::ModuleCompile(e.to_string()))?;
    register_get_header(&mut engine)?;
    Ok(engine)
}

/// Evaluates a boolean query against an engine with input already bound.
fn query_holds(engine: &mut Engine, query: String) -> AuthzResult<bool> {
    let results = engine
        .eval_query(query, false)
        .map_err(|e| AuthzError::evaluation(e.to_string()))?;
    Ok(results
        .result
        .iter()
        .flat_map(|r| r.expressions.iter())
        .any(|e| matches!(e.value, regorus::Value::Bool(true))))
}

/// A body split into its resolvable and unresolvable parts.
#[derive(Debug)]
struct BodySplit {
    known: Vec<String>,
    residual: Vec<String>,
}

/// Partitions a body's expressions around the unknown references.
///
/// A variable assigned from an unknown-dependent expression taints every
/// later expression that mentions it.
fn split_body(body: &str, unknowns: &[&str]) -> BodySplit {
    let mut known = Vec::new();
    let mut residual = Vec::new();
    let mut tainted: Vec<String> = Vec::new();

    for expr in body
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|e| !e.is_empty() && !e.starts_with('#'))
    {
        let depends = unknowns.iter().any(|u| expr.contains(u))
            || tainted.iter().any(|v| contains_ident(expr, v));

        if depends {
            for var in assigned_vars(expr) {
                if !tainted.contains(&var) {
                    tainted.push(var);
                }
            }
            residual.push(expr.to_string());
        } else {
            known.push(expr.to_string());
        }
    }

    BodySplit { known, residual }
}

/// Variables bound by an expression (`x := …`, `some x, y in …`).
fn assigned_vars(expr: &str) -> Vec<String> {
    if let Some(rest) = expr.strip_prefix("some ") {
        let vars = rest.split_once(" in ").map_or(rest, |(v, _)| v);
        return vars
            .split(',')
            .map(str::trim)
            .filter(|v| is_ident(v))
            .map(String::from)
            .collect();
    }

    if let Some((lhs, _)) = expr.split_once(":=") {
        let lhs = lhs.trim();
        if is_ident(lhs) {
            return vec![lhs.to_string()];
        }
    }

    Vec::new()
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(is_ident_char)
        && !s.as_bytes()[0].is_ascii_digit()
}

/// Whole-word search for an identifier inside an expression.
fn contains_ident(expr: &str, ident: &str) -> bool {
    let bytes = expr.as_bytes();
    let mut from = 0;
    while let Some(pos) = expr[from..].find(ident) {
        let start = from + pos;
        let end = start + ident.len();
        let before_ok = start == 0 || !is_ident_char(bytes[start - 1]);
        let after_ok = end >= bytes.len() || !is_ident_char(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        from = start + 1;
    }
    false
}

/// Extracts the bodies of every bodied definition of `rule`.
///
/// Recognizes `rule { … }` and `rule if { … }` heads at the start of a line
/// (leading whitespace and a `default` keyword allowed).
fn rule_bodies(content: &str, rule: &str) -> Vec<String> {
    let bytes = content.as_bytes();
    let mut bodies = Vec::new();
    let mut from = 0;

    while let Some(pos) = content[from..].find(rule) {
        let start = from + pos;
        let end = start + rule.len();
        from = end;

        if start > 0 && is_ident_char(bytes[start - 1]) {
            continue;
        }
        if end < bytes.len() && is_ident_char(bytes[end]) {
            continue;
        }

        let line_start = content[..start].rfind('\n').map_or(0, |p| p + 1);
        let prefix = content[line_start..start].trim();
        if !(prefix.is_empty() || prefix == "default") {
            continue;
        }

        let mut j = end;
        while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
            j += 1;
        }
        if content[j..].starts_with("if") {
            let after = j + 2;
            if after >= bytes.len() || !is_ident_char(bytes[after]) {
                j = after;
                while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                    j += 1;
                }
            }
        }
        if j >= bytes.len() || bytes[j] != b'{' {
            continue;
        }

        let mut depth = 0usize;
        let mut k = j;
        while k < bytes.len() {
            match bytes[k] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            k += 1;
        }
        if k < bytes.len() {
            bodies.push(content[j + 1..k].to_string());
            from = k + 1;
        }
    }

    bodies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(content: &str) -> PolicyModule {
        PolicyModule::new("example.rego", content)
    }

    fn plan(content: &str, rule: &str) -> ResidualPlan {
        ResidualPlan::compile(&module(content), rule, UNKNOWN_REFS).unwrap()
    }

    fn empty_input() -> serde_json::Value {
        serde_json::json!({})
    }

    #[test]
    fn test_rule_bodies_single() {
        let bodies = rule_bodies("package policies\ntodo { true }\n", "todo");
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].trim(), "true");
    }

    #[test]
    fn test_rule_bodies_multiple_and_multiline() {
        let content = concat!(
            "package policies\n",
            "allow {\n  input.a == 1\n  input.b == 2\n}\n",
            "allow if {\n  input.c == 3\n}\n",
            "allowed_extra { true }\n",
        );
        let bodies = rule_bodies(content, "allow");
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].contains("input.a == 1"));
        assert!(bodies[1].contains("input.c == 3"));
    }

    #[test]
    fn test_rule_bodies_ignores_references() {
        // A use of the rule inside another body is not a definition.
        let content = "package policies\nouter { todo }\ntodo { true }\n";
        let bodies = rule_bodies(content, "todo");
        assert_eq!(bodies.len(), 1);
    }

    #[test]
    fn test_split_body_taints_bound_vars() {
        let body = "\n  resource := data.resources[_]\n  resource.tenant == input.user.properties.tenant\n  input.request.method == \"GET\"\n";
        let split = split_body(body, UNKNOWN_REFS);
        assert_eq!(split.known, vec!["input.request.method == \"GET\""]);
        assert_eq!(split.residual.len(), 2);
        assert!(split.residual[1].contains("resource.tenant"));
    }

    #[test]
    fn test_split_body_some_in_unknown() {
        let body = "\n  some row in data.resources\n  row.owner == input.user.properties.id\n";
        let split = split_body(body, UNKNOWN_REFS);
        assert!(split.known.is_empty());
        assert_eq!(split.residual.len(), 2);
    }

    #[test]
    fn test_known_only_body_true_yields_one_empty_query() {
        let result = plan("package policies\ntodo { true }", "todo")
            .evaluate(&empty_input())
            .unwrap();
        assert_eq!(result.queries.len(), 1);
        assert!(result.queries[0].exprs.is_empty());
        assert!(!result.is_denied());
    }

    #[test]
    fn test_known_only_body_false_yields_no_queries() {
        let result = plan("package policies\ntodo { 1 == 2 }", "todo")
            .evaluate(&empty_input())
            .unwrap();
        assert!(result.is_denied());
    }

    #[test]
    fn test_unknown_exprs_survive_as_residual() {
        let result = plan(
            concat!(
                "package policies\n",
                "filter_rows {\n",
                "  input.request.method == \"GET\"\n",
                "  row := data.resources[_]\n",
                "  row.tenant == input.user.properties.tenant\n",
                "}\n",
            ),
            "filter_rows",
        )
        .evaluate(&serde_json::json!({
            "request": {"method": "GET"},
            "user": {"properties": {"tenant": "acme"}}
        }))
        .unwrap();

        assert_eq!(result.queries.len(), 1);
        let residual = &result.queries[0].exprs;
        assert_eq!(residual.len(), 2);
        assert!(residual[0].contains("data.resources"));
        assert!(residual[1].contains("row.tenant"));
    }

    #[test]
    fn test_known_part_failure_drops_residual_body() {
        let result = plan(
            concat!(
                "package policies\n",
                "filter_rows {\n",
                "  input.request.method == \"DELETE\"\n",
                "  row := data.resources[_]\n",
                "}\n",
            ),
            "filter_rows",
        )
        .evaluate(&serde_json::json!({"request": {"method": "GET"}}))
        .unwrap();
        assert!(result.is_denied());
    }

    #[test]
    fn test_multiple_bodies_contribute_independent_queries() {
        let result = plan(
            concat!(
                "package policies\n",
                "mixed { input.ok == true }\n",
                "mixed {\n  row := data.resources[_]\n  row.public == true\n}\n",
            ),
            "mixed",
        )
        .evaluate(&serde_json::json!({"ok": true}))
        .unwrap();

        assert_eq!(result.queries.len(), 2);
        assert!(result.queries[0].exprs.is_empty());
        assert_eq!(result.queries[1].exprs.len(), 2);
    }

    #[test]
    fn test_value_rule_falls_back_to_boolean() {
        let result = plan("package policies\ntodo = true", "todo")
            .evaluate(&empty_input())
            .unwrap();
        assert_eq!(result.queries.len(), 1);
    }

    #[test]
    fn test_compiled_plan_reevaluates_without_recompiling() {
        // One plan, many inputs: the compiled engine is cloned per call and
        // each evaluation sees only its own input.
        let plan = plan(
            "package policies\nfiltered { input.ok == true\n  row := data.resources[_] }",
            "filtered",
        );

        let granted = plan.evaluate(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(granted.queries.len(), 1);

        let denied = plan.evaluate(&serde_json::json!({"ok": false})).unwrap();
        assert!(denied.is_denied());

        let granted_again = plan.evaluate(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(granted_again.queries.len(), 1);
    }
}
