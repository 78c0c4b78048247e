//! The sidecar HTTP server.
//!
//! One task per connection, one strict pipeline per request:
//! status routes → policy middleware → proxy. Shared state is immutable
//! after startup; shutdown drains in-flight requests for the configured
//! window and then cancels whatever remains.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use portcullis_authz::{EvaluatorCache, PolicyModule};
use portcullis_router::RouteTable;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::Environment;
use crate::error::{SidecarError, SidecarResult};
use crate::health::HealthChecker;
use crate::middleware::PolicyMiddleware;
use crate::proxy::{ProxyClient, ProxyRequest};

/// Liveness probe path.
const HEALTHZ_PATH: &str = "/-/healthz";
/// Readiness probe path.
const READY_PATH: &str = "/-/ready";

/// The sidecar server: listener, middleware, and proxy.
pub struct SidecarServer {
    env: Arc<Environment>,
    middleware: PolicyMiddleware,
    proxy: Arc<ProxyClient>,
    health: Arc<HealthChecker>,
}

impl SidecarServer {
    /// Wires the server over startup-built shared state.
    pub fn new(
        env: Arc<Environment>,
        module: Arc<PolicyModule>,
        routes: Arc<RouteTable>,
        evaluators: Arc<EvaluatorCache>,
    ) -> SidecarResult<Self> {
        let proxy = Arc::new(ProxyClient::new()?);
        let health = Arc::new(HealthChecker::new(routes.len(), evaluators.len()));
        let middleware = PolicyMiddleware::new(env.clone(), module, routes, evaluators);

        Ok(Self {
            env,
            middleware,
            proxy,
            health,
        })
    }

    /// Runs until a shutdown signal arrives, then drains.
    pub async fn run(self) -> SidecarResult<()> {
        let port: u16 = self
            .env
            .http_port
            .parse()
            .map_err(|_| SidecarError::config(format!("invalid HTTP_PORT: {}", self.env.http_port)))?;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SidecarError::server(format!("failed to bind {addr}: {e}")))?;

        info!(
            %addr,
            upstream = %crate::proxy::base_url(&self.env.target_service_host),
            "sidecar listening"
        );
        self.health.set_ready(true);

        let mut connections = JoinSet::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    self.spawn_connection(&mut connections, stream, peer_addr);
                }
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.health.set_ready(false);
        drop(listener);

        let drain = Duration::from_secs(self.env.delay_shutdown_seconds);
        info!(window_seconds = drain.as_secs(), "draining in-flight requests");
        let drained = tokio::time::timeout(drain, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("drain window elapsed, cancelling remaining requests");
        }

        Ok(())
    }

    fn spawn_connection(
        &self,
        connections: &mut JoinSet<()>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) {
        let middleware = self.middleware.clone();
        let proxy = self.proxy.clone();
        let health = self.health.clone();

        connections.spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let middleware = middleware.clone();
                let proxy = proxy.clone();
                let health = health.clone();
                async move { handle_request(req, middleware, proxy, health, peer_addr).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer_addr, error = %e, "connection closed with error");
            }
        });
    }
}

/// Handles one request end to end.
pub(crate) async fn handle_request(
    req: Request<Incoming>,
    middleware: PolicyMiddleware,
    proxy: Arc<ProxyClient>,
    health: Arc<HealthChecker>,
    peer_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let start = Instant::now();
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(ToString::to_string)
        .unwrap_or_else(|| "/".to_string());
    let request_id = Uuid::now_v7().to_string();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path_and_query,
        peer = %peer_addr,
    );

    async move {
        match req.uri().path() {
            HEALTHZ_PATH => return Ok(json_response(StatusCode::OK, &health.liveness())),
            READY_PATH => {
                let readiness = health.readiness();
                let status = if readiness.status == "ready" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                return Ok(json_response(status, &readiness));
            }
            _ => {}
        }

        // The decision needs only method, path and headers; the body is
        // buffered afterwards, for forwarding alone.
        let decision = middleware.authorize(req.method(), req.uri(), req.headers());

        let ctx = match decision {
            Ok(ctx) => ctx,
            Err(e) => {
                debug!(
                    status = e.status_code(),
                    error = %e,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "request rejected"
                );
                return Ok(denial_response(&e, &request_id));
            }
        };

        // The proxy target comes from the environment carried with the
        // request; losing it is a programmer error, not a routing outcome.
        let env = match ctx.environment() {
            Ok(env) => env.clone(),
            Err(e) => {
                error!(error = %e, "no environment found in context");
                return Ok(denial_response(&e, &request_id));
            }
        };

        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                return Ok(denial_response(
                    &SidecarError::proxy("failed to read request body"),
                    &request_id,
                ));
            }
        };

        let proxy_req = ProxyRequest::new(parts.method, &path_and_query)
            .with_headers(parts.headers)
            .with_body(body_bytes);

        match proxy.forward(&env, proxy_req).await {
            Ok(upstream) => {
                info!(
                    status = upstream.status.as_u16(),
                    matched_path = %ctx.router_info().map(|i| i.matched_path.as_str()).unwrap_or(""),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "request forwarded"
                );

                let mut builder = Response::builder().status(upstream.status);
                for (name, value) in &crate::proxy::filter_hop_by_hop(&upstream.headers) {
                    builder = builder.header(name, value);
                }
                builder = builder.header("x-request-id", &request_id);

                Ok(builder.body(Full::new(upstream.body)).unwrap_or_else(|_| {
                    fallback_response(StatusCode::INTERNAL_SERVER_ERROR)
                }))
            }
            Err(e) => {
                error!(
                    error = %e,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "upstream request failed"
                );
                Ok(denial_response(&e, &request_id))
            }
        }
    }
    .instrument(span)
    .await
}

/// Serializes a body as an `application/json` response.
fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap_or_else(|_| fallback_response(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Renders a [`SidecarError`] as its structured wire body.
fn denial_response(error: &SidecarError, request_id: &str) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = error.to_request_error();
    let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-request-id", request_id)
        .body(Full::new(Bytes::from(json)))
        .unwrap_or_else(|_| fallback_response(status))
}

fn fallback_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
