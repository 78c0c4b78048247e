//! Policy input types.
//!
//! The input object delivered to every policy evaluation. Field names
//! follow the wire schema policies are authored against:
//!
//! ```json
//! { "request":  { "method", "path", "headers": {"K": ["V"]},
//!                 "query": {"K": ["V"]}, "pathParams": {"K": "V"} },
//!   "user":     { "properties": {}, "groups": [], "bindings": [], "roles": [] },
//!   "clientType": "" }
//! ```

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::AuthzResult;

/// The object bound as `input` for one policy evaluation.
///
/// Built per request and discarded after evaluation; the cached evaluators
/// never retain it.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    /// The HTTP request slice of the input.
    pub request: InputRequest,
    /// The caller slice of the input.
    pub user: InputUser,
    /// Value of the client-type header, or empty.
    #[serde(rename = "clientType")]
    pub client_type: String,
}

impl Default for PolicyInput {
    fn default() -> Self {
        Self {
            request: InputRequest::default(),
            user: InputUser::default(),
            client_type: String::new(),
        }
    }
}

/// Request portion of [`PolicyInput`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct InputRequest {
    /// Uppercase HTTP verb.
    pub method: String,
    /// Matched template for template routes; stripped raw path for prefix
    /// routes without variables.
    pub path: String,
    /// Canonicalized header name → ordered values.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Query key → ordered values.
    pub query: BTreeMap<String, Vec<String>>,
    /// Named captures from template matching.
    #[serde(rename = "pathParams")]
    pub path_params: BTreeMap<String, String>,
}

/// Caller portion of [`PolicyInput`].
#[derive(Debug, Clone, Serialize)]
pub struct InputUser {
    /// Parsed JSON user properties, `{}` when the header is absent or
    /// invalid.
    pub properties: serde_json::Value,
    /// Comma-split group list, `[]` when absent.
    pub groups: Vec<String>,
    /// Opaque binding documents fetched out-of-band.
    pub bindings: Vec<serde_json::Value>,
    /// Opaque role documents fetched out-of-band.
    pub roles: Vec<serde_json::Value>,
}

impl Default for InputUser {
    fn default() -> Self {
        Self {
            properties: serde_json::Value::Object(serde_json::Map::new()),
            groups: Vec::new(),
            bindings: Vec::new(),
            roles: Vec::new(),
        }
    }
}

/// Bindings and roles granted to a caller, as returned by a
/// [`UserBindingsProvider`].
#[derive(Debug, Clone, Default)]
pub struct UserGrants {
    /// Opaque binding documents.
    pub bindings: Vec<serde_json::Value>,
    /// Opaque role documents.
    pub roles: Vec<serde_json::Value>,
}

/// Interface to the external collaborator that resolves a caller's bindings
/// and roles.
///
/// The production implementation reads a user store; the sidecar core only
/// forwards whatever it returns into `input.user.bindings` / `input.user.roles`.
/// Without a provider both lists stay empty.
pub trait UserBindingsProvider: Send + Sync {
    /// Resolves grants for a caller identified by its groups and decoded
    /// properties.
    fn grants_for(
        &self,
        groups: &[String],
        properties: &serde_json::Value,
    ) -> AuthzResult<UserGrants>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_input_shape() {
        let input = PolicyInput::default();
        let json = serde_json::to_value(&input).unwrap();

        assert_eq!(json["clientType"], "");
        assert_eq!(json["user"]["properties"], serde_json::json!({}));
        assert_eq!(json["user"]["groups"], serde_json::json!([]));
        assert_eq!(json["request"]["pathParams"], serde_json::json!({}));
    }

    #[test]
    fn test_wire_field_names() {
        let mut input = PolicyInput::default();
        input.request.method = "GET".to_string();
        input.request.path = "/users/{id}".to_string();
        input
            .request
            .path_params
            .insert("id".to_string(), "42".to_string());
        input.client_type = "frontend".to_string();

        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"pathParams\":{\"id\":\"42\"}"));
        assert!(json.contains("\"clientType\":\"frontend\""));
        assert!(!json.contains("path_params"));
        assert!(!json.contains("client_type"));
    }

    #[test]
    fn test_headers_preserve_value_order() {
        let mut input = PolicyInput::default();
        input.request.headers.insert(
            "Accept".to_string(),
            vec!["text/html".to_string(), "application/json".to_string()],
        );

        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(
            json["request"]["headers"]["Accept"],
            serde_json::json!(["text/html", "application/json"])
        );
    }
}
