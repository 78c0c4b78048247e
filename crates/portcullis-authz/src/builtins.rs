//! Custom built-in functions exposed to policies.

use regorus::Engine;

use crate::error::{AuthzError, AuthzResult};

/// Name under which the header-lookup built-in is registered.
pub const GET_HEADER_BUILTIN: &str = "get_header";

/// Canonicalizes an HTTP header key: the first letter of each
/// hyphen-separated segment is uppercased, the rest lowercased.
///
/// This is the form the policy input uses for `request.headers`, so
/// `get_header` can resolve keys case-insensitively against it.
///
/// ```rust
/// use portcullis_authz::canonical_header_key;
///
/// assert_eq!(canonical_header_key("x-api-key"), "X-Api-Key");
/// assert_eq!(canonical_header_key("CONTENT-TYPE"), "Content-Type");
/// ```
#[must_use]
pub fn canonical_header_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut uppercase_next = true;
    for c in key.chars() {
        if c == '-' {
            out.push('-');
            uppercase_next = true;
        } else if uppercase_next {
            out.extend(c.to_uppercase());
            uppercase_next = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Registers the `get_header` built-in on `engine`.
///
/// Signature inside policies: `get_header(headerKey, headers) → string`.
/// Returns the first value of `headers[canonical(headerKey)]`, or the empty
/// string when the header is absent. The function is pure: registration
/// happens once, when the cached engines are compiled, never per request.
pub fn register_get_header(engine: &mut Engine) -> AuthzResult<()> {
    engine
        .add_extension(
            GET_HEADER_BUILTIN.to_string(),
            2,
            Box::new(|args: Vec<regorus::Value>| {
                let key = match &args[0] {
                    regorus::Value::String(s) => s.to_string(),
                    other => anyhow::bail!("get_header: header key must be a string, got {other}"),
                };
                let headers = serde_json::to_value(&args[1])
                    .map_err(|e| anyhow::anyhow!("get_header: invalid headers object: {e}"))?;

                let value = headers
                    .get(canonical_header_key(&key))
                    .and_then(|values| values.get(0))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();

                Ok(serde_json::Value::String(value).into())
            }),
        )
        .map_err(|e| AuthzError::ModuleCompile(format!("failed to register get_header: {e}")))
}
