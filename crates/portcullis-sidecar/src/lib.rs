//! Portcullis — an authorization sidecar.
//!
//! The sidecar sits in front of a target service and decides, per request,
//! whether to forward it. Three startup-built inputs drive every decision:
//!
//! - an OpenAPI document whose `x-permission` extensions map each route to
//!   the policy that guards it ([`portcullis_router::RouteTable`]);
//! - a Rego policy module loaded from a directory
//!   ([`portcullis_authz::PolicyModule`]);
//! - the request itself: headers, method, path, query, and the decoded
//!   caller identity.
//!
//! # Architecture
//!
//! ```text
//!             ┌──────────────────────────────────────────────────┐
//!             │                Portcullis sidecar                 │
//!   request   │  ┌─────────────┐   ┌────────────┐   ┌─────────┐  │   upstream
//!  ─────────► │  │  Policy     │──►│ Evaluator  │──►│  Proxy  │──┼──────────►
//!             │  │  middleware │   │ (regorus)  │   │ (host   │  │
//!  ◄───────── │  │  (routes,   │   │ clone per  │   │ rewrite)│  │ ◄──────────
//!   response  │  │  context)   │   │ request    │   └─────────┘  │
//!             │  └─────────────┘   └────────────┘                │
//!             │         │ deny: {statusCode, error, message}     │
//!             └─────────┼──────────────────────────────────────--┘
//!                       ▼
//!              structured denial (403/404/500)
//! ```
//!
//! The route table, evaluator cache, policy module and environment are
//! read-only after startup and shared without locks; everything
//! request-scoped lives in a [`context::RequestContext`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod middleware;
pub mod oas;
pub mod proxy;
pub mod server;

pub use config::Environment;
pub use context::{Caller, RequestContext, RouterInfo};
pub use error::{RequestError, SidecarError, SidecarResult};
pub use health::HealthChecker;
pub use middleware::PolicyMiddleware;
pub use proxy::{ProxyClient, ProxyRequest, ProxyResponse};
pub use server::SidecarServer;

/// Sidecar version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
