//! Upstream forwarding.
//!
//! Once the middleware clears a request, the proxy forwards it to the
//! target host verbatim: same method, same path and query, same headers
//! (minus hop-by-hop ones, which belong to each connection) and the same
//! body. Only the host is rewritten.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use http::{Method, StatusCode};
use reqwest::Client;

use crate::config::Environment;
use crate::error::{SidecarError, SidecarResult};

/// Hop-by-hop headers, owned by each connection rather than the request.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client that forwards requests to the target service.
///
/// The client is connection state only; the target host is passed per call
/// because it comes from the [`Environment`] carried in each request's
/// context.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: Client,
}

impl ProxyClient {
    /// Creates a proxy client.
    ///
    /// No timeout is imposed here: upstream timeouts are the caller's
    /// responsibility.
    pub fn new() -> SidecarResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| SidecarError::proxy(format!("failed to create client: {e}")))?;

        Ok(Self { client })
    }

    /// Forwards a request to `env`'s target host and returns the upstream
    /// response.
    pub async fn forward(
        &self,
        env: &Environment,
        request: ProxyRequest,
    ) -> SidecarResult<ProxyResponse> {
        let url = format!(
            "{}{}",
            base_url(&env.target_service_host),
            request.path_and_query
        );

        let mut headers = filter_hop_by_hop(&request.headers);
        if !headers.contains_key(USER_AGENT) {
            // Suppress the client library's default instead of inventing
            // an agent the original request never sent.
            headers.insert(USER_AGENT, HeaderValue::from_static(""));
        }

        let response = self
            .client
            .request(request.method, &url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| SidecarError::upstream(format!("request failed: {e}")))?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| SidecarError::upstream(format!("failed to read body: {e}")))?;

        Ok(ProxyResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

/// Normalizes the configured host into a base URL.
pub(crate) fn base_url(target_host: &str) -> String {
    if target_host.contains("://") {
        target_host.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", target_host.trim_end_matches('/'))
    }
}

/// Drops hop-by-hop headers; everything else is forwarded untouched.
pub(crate) fn filter_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// A request cleared for forwarding.
#[derive(Debug)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// Path plus query string, as requested.
    pub path_and_query: String,
    /// Original request headers.
    pub headers: HeaderMap,
    /// Buffered request body.
    pub body: Bytes,
}

impl ProxyRequest {
    /// Creates a bodyless request.
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Sets the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// The upstream response, buffered for relaying.
#[derive(Debug)]
pub struct ProxyResponse {
    /// Upstream status.
    pub status: StatusCode,
    /// Upstream headers.
    pub headers: HeaderMap,
    /// Upstream body.
    pub body: Bytes,
}
