//! Liveness and readiness probes.
//!
//! Served under `/-/healthz` and `/-/ready`, ahead of the policy
//! middleware, so orchestrators can probe the sidecar without matching the
//! OpenAPI surface or passing any policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Result of a single readiness check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Name of the check.
    pub name: String,
    /// Whether it passed.
    pub passed: bool,
    /// Optional detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    /// A passing check.
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: Some(message.into()),
        }
    }

    /// A failing check.
    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// Liveness response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `healthy` once the process serves traffic.
    pub status: &'static str,
    /// Seconds since startup.
    pub uptime_seconds: u64,
    /// Binary version.
    pub version: &'static str,
}

/// Readiness response body.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`.
    pub status: &'static str,
    /// Individual check results.
    pub checks: Vec<CheckResult>,
}

/// Tracks whether the sidecar is ready to take traffic.
#[derive(Debug)]
pub struct HealthChecker {
    start_time: Instant,
    ready: AtomicBool,
    route_count: usize,
    policy_count: usize,
}

impl HealthChecker {
    /// Creates a checker over the startup-built table sizes.
    #[must_use]
    pub fn new(route_count: usize, policy_count: usize) -> Self {
        Self {
            start_time: Instant::now(),
            ready: AtomicBool::new(false),
            route_count,
            policy_count,
        }
    }

    /// Marks the sidecar ready (called once the listener is bound).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the sidecar is ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Liveness: the process is up.
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy",
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: crate::VERSION,
        }
    }

    /// Readiness: startup state is loaded and the listener is accepting.
    pub fn readiness(&self) -> ReadinessResponse {
        let mut checks = vec![CheckResult::pass(
            "routes",
            format!("{} operations registered", self.route_count),
        )];

        checks.push(if self.policy_count > 0 {
            CheckResult::pass("policies", format!("{} policies compiled", self.policy_count))
        } else {
            CheckResult::pass("policies", "no policies referenced".to_string())
        });

        checks.push(if self.is_ready() {
            CheckResult::pass("listener", "accepting connections".to_string())
        } else {
            CheckResult::fail("listener", "not accepting yet".to_string())
        });

        let all_passed = checks.iter().all(|c| c.passed);
        ReadinessResponse {
            status: if all_passed { "ready" } else { "not_ready" },
            checks,
        }
    }
}
