//! Policy module loading.
//!
//! The policy source lives in a directory of `.rego` files, all declaring
//! `package policies`. They are read once at startup and concatenated into a
//! single immutable module; the sidecar never reloads policies at runtime.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::info;

use crate::error::{AuthzError, AuthzResult};

/// File extension of policy sources.
const POLICY_EXTENSION: &str = "rego";

/// An immutable, in-memory policy module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyModule {
    /// Module name, used as the engine's source file name.
    pub name: String,
    /// Concatenated Rego source.
    pub content: String,
}

impl PolicyModule {
    /// Creates a module from a name and raw source.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Loads every `.rego` file under `dir` into a single module.
    ///
    /// Files are concatenated in name order so the module content is
    /// deterministic. An absent directory, or one containing no policy
    /// files, is fatal: the sidecar must not start without policies.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> AuthzResult<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| AuthzError::module_load(dir, e.to_string()))?;

        let mut files: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == POLICY_EXTENSION)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(AuthzError::module_load(
                dir,
                "no policy files found in directory",
            ));
        }

        let mut content = String::new();
        for path in &files {
            let source = std::fs::read_to_string(path)
                .map_err(|e| AuthzError::module_load(path.clone(), e.to_string()))?;
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&source);
        }

        let name = files[0]
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("policies.rego")
            .to_string();

        info!(directory = %dir.display(), files = files.len(), "loaded policy module");

        Ok(Self { name, content })
    }

    /// Names of the rules declared in this module.
    ///
    /// This is a lexical scan of rule heads, used at startup to catch
    /// OpenAPI documents that reference a policy with no matching rule. It
    /// recognizes bodied rules (`name { … }`, `name if { … }`), value rules
    /// (`name = …`, `name := …`) and `default name = …` declarations.
    #[must_use]
    pub fn rule_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();

        for raw in self.content.lines() {
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = match line.strip_prefix("default ") {
                Some(rest) => rest.trim_start(),
                None if line.starts_with("package ") || line.starts_with("import ") => continue,
                None => line,
            };

            let ident_len = line
                .char_indices()
                .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
                .count();
            if ident_len == 0 {
                continue;
            }
            let (ident, rest) = line.split_at(ident_len);
            if ident.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                continue;
            }

            let rest = rest.trim_start();
            let is_head = rest.starts_with('{')
                || (rest.starts_with('=') && !rest.starts_with("=="))
                || rest.starts_with(":=")
                || rest.starts_with('(')
                || rest.starts_with('[')
                || rest == "if"
                || rest.starts_with("if ")
                || rest.starts_with("if{");
            if is_head {
                names.insert(ident.to_string());
            }
        }

        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_names_bodied_rules() {
        let module = PolicyModule::new(
            "example.rego",
            "package policies\n\nfoobar { true }\nvery_very_composed_permission { true }\n",
        );
        let names = module.rule_names();
        assert!(names.contains("foobar"));
        assert!(names.contains("very_very_composed_permission"));
        assert!(!names.contains("package"));
        assert!(!names.contains("policies"));
    }

    #[test]
    fn test_rule_names_value_and_default_rules() {
        let module = PolicyModule::new(
            "example.rego",
            concat!(
                "package policies\n",
                "import input.request\n",
                "default allow = false\n",
                "allow { input.user.groups[_] == \"admin\" }\n",
                "limit := 20\n",
                "# comment { not_a_rule }\n",
            ),
        );
        let names = module.rule_names();
        assert!(names.contains("allow"));
        assert!(names.contains("limit"));
        assert!(!names.contains("not_a_rule"));
        assert!(!names.contains("input"));
    }

    #[test]
    fn test_load_from_missing_dir_fails() {
        let err = PolicyModule::load_from_dir("/definitely/not/a/directory").unwrap_err();
        assert!(matches!(err, AuthzError::ModuleLoad { .. }));
    }

    #[test]
    fn test_load_from_dir_concatenates_sorted() {
        let dir = std::env::temp_dir().join(format!(
            "portcullis-module-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.rego"), "second { true }\n").unwrap();
        std::fs::write(dir.join("a.rego"), "package policies\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let module = PolicyModule::load_from_dir(&dir).unwrap();
        assert_eq!(module.name, "a.rego");
        let a_pos = module.content.find("package policies").unwrap();
        let b_pos = module.content.find("second").unwrap();
        assert!(a_pos < b_pos);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_from_empty_dir_fails() {
        let dir = std::env::temp_dir().join(format!(
            "portcullis-empty-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let err = PolicyModule::load_from_dir(&dir).unwrap_err();
        assert!(err.to_string().contains("no policy files"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
