//! Environment configuration.
//!
//! The sidecar is configured entirely through environment variables, read
//! once at startup. Anything missing or malformed among the required
//! options is a fatal configuration error; the process never starts with a
//! partial environment.

use std::path::PathBuf;

use crate::error::{SidecarError, SidecarResult};

/// Default header carrying the JSON-encoded user properties.
pub const DEFAULT_USER_PROPERTIES_HEADER: &str = "miauserproperties";
/// Default header carrying the comma-separated user groups.
pub const DEFAULT_USER_GROUPS_HEADER: &str = "miausergroups";
/// Default header carrying the client type.
pub const DEFAULT_CLIENT_TYPE_HEADER: &str = "Client-Type";
/// Default prefix stripped from request paths in standalone mode.
pub const DEFAULT_PATH_PREFIX_STANDALONE: &str = "/eval";

/// Process-wide configuration, resolved from the environment once.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Logger verbosity (`info`, `trace`, `debug`, `warning`, `error`).
    pub log_level: String,
    /// Port the sidecar listens on.
    pub http_port: String,
    /// Upstream host requests are proxied to.
    pub target_service_host: String,
    /// Path that triggers documentation passthrough.
    pub target_service_oas_path: Option<String>,
    /// Static OpenAPI file overriding the auto-fetch.
    pub api_permissions_file_path: Option<PathBuf>,
    /// Directory of policy source files.
    pub opa_modules_directory: PathBuf,
    /// Header carrying JSON user properties.
    pub user_properties_header_key: String,
    /// Header carrying comma-separated groups.
    pub user_groups_header_key: String,
    /// Header carrying the client type.
    pub client_type_header_key: String,
    /// Graceful-shutdown window, in seconds.
    pub delay_shutdown_seconds: u64,
    /// Whether standalone path-prefix stripping is enabled.
    pub standalone: bool,
    /// Prefix stripped in standalone mode.
    pub path_prefix_standalone: String,
}

impl Environment {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> SidecarResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    ///
    /// `from_env` goes through here; tests inject their own lookup instead
    /// of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SidecarResult<Self> {
        let required = |key: &str| -> SidecarResult<String> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SidecarError::config(format!("missing required env: {key}")))
        };
        let or_default =
            |key: &str, default: &str| lookup(key).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string());

        let delay_shutdown_seconds = match lookup("DELAY_SHUTDOWN_SECONDS") {
            Some(raw) if !raw.is_empty() => raw.parse().map_err(|_| {
                SidecarError::config(format!("invalid DELAY_SHUTDOWN_SECONDS: {raw}"))
            })?,
            _ => 10,
        };

        let standalone = match lookup("STANDALONE") {
            Some(raw) if !raw.is_empty() => raw.parse().map_err(|_| {
                SidecarError::config(format!("invalid STANDALONE: {raw}"))
            })?,
            _ => false,
        };

        let env = Self {
            log_level: or_default("LOG_LEVEL", "info"),
            http_port: or_default("HTTP_PORT", "8080"),
            target_service_host: required("TARGET_SERVICE_HOST")?,
            target_service_oas_path: lookup("TARGET_SERVICE_OAS_PATH").filter(|v| !v.is_empty()),
            api_permissions_file_path: lookup("API_PERMISSIONS_FILE_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            opa_modules_directory: PathBuf::from(required("OPA_MODULES_DIRECTORY")?),
            user_properties_header_key: or_default(
                "USER_PROPERTIES_HEADER_KEY",
                DEFAULT_USER_PROPERTIES_HEADER,
            ),
            user_groups_header_key: or_default(
                "USER_GROUPS_HEADER_KEY",
                DEFAULT_USER_GROUPS_HEADER,
            ),
            client_type_header_key: or_default(
                "CLIENT_TYPE_HEADER_KEY",
                DEFAULT_CLIENT_TYPE_HEADER,
            ),
            delay_shutdown_seconds,
            standalone,
            path_prefix_standalone: or_default(
                "PATH_PREFIX_STANDALONE",
                DEFAULT_PATH_PREFIX_STANDALONE,
            ),
        };

        env.validate()?;
        Ok(env)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> SidecarResult<()> {
        const LEVELS: &[&str] = &["info", "trace", "debug", "warning", "error"];
        if !LEVELS.contains(&self.log_level.as_str()) {
            return Err(SidecarError::config(format!(
                "invalid LOG_LEVEL: {}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// The tracing filter directive for the configured log level.
    #[must_use]
    pub fn tracing_level(&self) -> &str {
        // `warning` is the documented value; tracing spells it `warn`.
        match self.log_level.as_str() {
            "warning" => "warn",
            other => other,
        }
    }
}
