//! Rego policy evaluation for the Portcullis sidecar.
//!
//! This crate owns everything between "a route names a policy" and
//! "allow/deny":
//!
//! - [`PolicyModule`] — the immutable policy source, loaded once from a
//!   directory of `.rego` files under the `policies` package;
//! - [`EvaluatorCache`] — one pre-compiled query per policy name referenced
//!   by the route table, built at startup;
//! - [`PolicyEvaluator`] / [`BoundEvaluator`] — the per-request clone that
//!   binds a [`PolicyInput`] and answers `eval` (boolean) or `partial`
//!   (residual queries for row-filter policies);
//! - the `get_header` built-in, registered at compile time so policies get
//!   case-insensitive header access.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use portcullis_authz::{EvaluatorCache, PolicyInput, PolicyModule};
//!
//! let module = Arc::new(PolicyModule::new(
//!     "example.rego",
//!     "package policies\nfoobar { true }",
//! ));
//! let cache = EvaluatorCache::build(&module, vec!["foobar".to_string()]).unwrap();
//!
//! let mut bound = cache
//!     .get("foobar")
//!     .unwrap()
//!     .for_input(&PolicyInput::default())
//!     .unwrap();
//! assert!(bound.eval().unwrap());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builtins;
pub mod cache;
pub mod error;
pub mod evaluator;
pub mod input;
pub mod module;
pub mod partial;

pub use builtins::{canonical_header_key, register_get_header, GET_HEADER_BUILTIN};
pub use cache::EvaluatorCache;
pub use error::{AuthzError, AuthzResult};
pub use evaluator::{canonical_policy_id, BoundEvaluator, PolicyEvaluator};
pub use input::{InputRequest, InputUser, PolicyInput, UserBindingsProvider, UserGrants};
pub use module::PolicyModule;
pub use partial::{PartialResult, ResidualQuery, UNKNOWN_REFS};
