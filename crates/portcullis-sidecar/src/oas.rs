//! OpenAPI document sourcing.
//!
//! The permission surface comes from one of two places, resolved once at
//! startup: a static file (`API_PERMISSIONS_FILE_PATH`), or a fetch of the
//! target service's own documentation endpoint. The file wins when both
//! are configured; neither configured is a fatal error.

use portcullis_router::OpenApiSpec;
use tracing::info;

use crate::config::Environment;
use crate::error::{SidecarError, SidecarResult};
use crate::proxy;

/// Loads the OpenAPI document per the environment's configuration.
pub async fn load_openapi_spec(env: &Environment) -> SidecarResult<OpenApiSpec> {
    if let Some(path) = &env.api_permissions_file_path {
        info!(path = %path.display(), "loading OpenAPI document from file");
        let raw = tokio::fs::read(path).await.map_err(|e| {
            SidecarError::config(format!(
                "failed to read OpenAPI file {}: {e}",
                path.display()
            ))
        })?;
        return OpenApiSpec::from_json(&raw)
            .map_err(|e| SidecarError::config(format!("invalid OpenAPI file: {e}")));
    }

    let oas_path = env.target_service_oas_path.as_deref().ok_or_else(|| {
        SidecarError::config(
            "no OpenAPI source: set API_PERMISSIONS_FILE_PATH or TARGET_SERVICE_OAS_PATH",
        )
    })?;

    let url = format!("{}{oas_path}", proxy::base_url(&env.target_service_host));
    info!(url = %url, "fetching OpenAPI document from target service");

    let raw = reqwest::get(&url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| SidecarError::config(format!("failed to fetch OpenAPI document: {e}")))?
        .bytes()
        .await
        .map_err(|e| SidecarError::config(format!("failed to read OpenAPI document: {e}")))?;

    OpenApiSpec::from_json(&raw)
        .map_err(|e| SidecarError::config(format!("invalid OpenAPI document: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(vars: Vec<(&'static str, String)>) -> Environment {
        Environment::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .or_else(|| match key {
                    "TARGET_SERVICE_HOST" => Some("localhost:3000".to_string()),
                    "OPA_MODULES_DIRECTORY" => Some("/policies".to_string()),
                    _ => None,
                })
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("portcullis-oas-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"paths": {"/users/": {"get": {"x-permission": {"allow": "todo"}}}}}"#,
        )
        .unwrap();

        let env = environment(vec![(
            "API_PERMISSIONS_FILE_PATH",
            path.display().to_string(),
        )]);
        let spec = load_openapi_spec(&env).await.unwrap();
        assert!(spec.paths.contains_key("/users/"));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let env = environment(vec![(
            "API_PERMISSIONS_FILE_PATH",
            "/no/such/file.json".to_string(),
        )]);
        let err = load_openapi_spec(&env).await.unwrap_err();
        assert!(matches!(err, SidecarError::Config { .. }));
    }

    #[tokio::test]
    async fn test_no_source_is_config_error() {
        let env = environment(vec![]);
        let err = load_openapi_spec(&env).await.unwrap_err();
        assert!(err.to_string().contains("no OpenAPI source"));
    }
}
