//! OpenAPI-derived permission routing for the Portcullis sidecar.
//!
//! This crate turns an OpenAPI document annotated with `x-permission`
//! extensions into an immutable [`RouteTable`] that answers, per request,
//! "which authorization policy guards this route?".
//!
//! Matching uses a radix tree over path segments:
//!
//! ```text
//!                    (root)
//!                      │
//!              ┌───────┴────────┐
//!              │                │
//!           "users"         "assets"
//!              │                │
//!        ┌─────┴─────┐         "*"
//!        │           │     (prefix route)
//!      (leaf)     "{id}"
//!    [GET,POST]      │
//!                  (leaf)
//!                [GET,DELETE]
//! ```
//!
//! Static segments win over `{param}` segments, which win over trailing `/*`
//! prefix captures. Registering the same `(template, method)` twice is an
//! error: the table must match at most one route per request, and ambiguity
//! has to surface at startup rather than at traffic time.
//!
//! # Example
//!
//! ```rust
//! use http::Method;
//! use portcullis_router::{OpenApiSpec, RouteTable};
//!
//! let spec: OpenApiSpec = serde_json::from_str(r#"{
//!     "paths": {
//!         "/users/": {
//!             "get": {"x-permission": {"allow": "foobar"}}
//!         }
//!     }
//! }"#).unwrap();
//!
//! let table = RouteTable::from_spec(&spec).unwrap();
//! let matched = table.lookup(&Method::GET, "/users/").unwrap();
//! assert_eq!(matched.config.request_flow.policy_name, "foobar");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub(crate) mod node;
mod oas;
mod params;
mod permission_set;
mod table;

pub use error::{RouterError, RouterResult};
pub use oas::{
    OpenApiSpec, Operation, PathItem, RequestFlow, ResourceFilter, ResponseFilter, ResponseFlow,
    RondConfig, RowFilter, XPermission,
};
pub use params::PathParams;
pub use permission_set::PermissionSet;
pub use table::{RouteMatch, RouteTable};
