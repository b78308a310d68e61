//! Public listener: informational endpoints, CORS preflight, and dispatch
//! of `/{name}/...` paths to the streaming proxy

use crate::error::{json_error_response, ErrorCode};
use crate::headers::CorsPolicy;
use crate::process::{BackendStatus, SupervisorRegistry};
use crate::proxy::{ProxyBody, StreamingProxy};
use crate::routes::RouteTable;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Everything a request handler needs, shared read-only across connections
pub struct GatewayState {
    pub name: String,
    pub routes: RouteTable,
    pub registry: Arc<SupervisorRegistry>,
    pub proxy: StreamingProxy,
    pub cors: CorsPolicy,
    pub sse_path: String,
    pub message_path: String,
}

impl GatewayState {
    fn status_of(&self, name: &str) -> BackendStatus {
        // Every route comes from a launched backend; a miss can only mean it never started
        self.registry.status(name).unwrap_or(BackendStatus::Error)
    }
}

#[derive(Serialize)]
struct IndexServer {
    name: String,
    #[serde(rename = "sseUrl")]
    sse_url: String,
    #[serde(rename = "messageUrl")]
    message_url: String,
    status: BackendStatus,
}

#[derive(Serialize)]
struct IndexBody {
    name: String,
    version: &'static str,
    servers: Vec<IndexServer>,
}

#[derive(Serialize)]
struct HealthServer {
    name: String,
    port: u16,
    status: BackendStatus,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    servers: Vec<HealthServer>,
}

/// The public HTTP listener
pub struct GatewayServer {
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    /// `shutdown_rx` flipping to `true` stops the accept loop
    pub fn new(listener: TcpListener, state: Arc<GatewayState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listener,
            state,
            shutdown_rx,
        }
    }

    /// Accept connections until shutdown. Returning drops the listener, so
    /// no new connections are accepted afterwards.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Usually fd exhaustion; back off instead of spinning
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Gateway listener closed");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<GatewayState>) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // No timer is configured, so header-read and idle timeouts stay off and
    // long-lived event streams are never cut by the server.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    debug!(client = %client_addr, method = %req.method(), uri = %req.uri(), "Incoming request");

    if req.method() == Method::OPTIONS {
        return Ok(preflight_response(&state.cors));
    }

    if req.method() == Method::GET {
        match req.uri().path() {
            "/" => return Ok(index_response(&req, &state)),
            "/health" => return Ok(health_response(&state)),
            _ => {}
        }
    }

    let path = req.uri().path().to_string();
    let Some(resolved) = state.routes.resolve(&path) else {
        debug!(path = %path, "No route for path");
        return Ok(json_error_response(
            ErrorCode::UnknownRoute,
            None,
            format!("No server is configured for path '{}'", path),
            &state.cors,
        ));
    };

    let server = resolved.route.name.as_str();
    let status = state.status_of(server);
    if status != BackendStatus::Ready {
        debug!(server, %status, "Rejecting request for backend that is not ready");
        return Ok(json_error_response(
            ErrorCode::BackendNotReady,
            Some(server),
            format!("Server '{}' is {}", server, status),
            &state.cors,
        ));
    }

    Ok(state.proxy.forward(req, &resolved).await)
}

fn preflight_response(cors: &CorsPolicy) -> Response<ProxyBody> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.headers_mut() = cors.preflight_headers();
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T, cors: &CorsPolicy) -> Response<ProxyBody> {
    let json = match serde_json::to_vec(body) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return json_error_response(ErrorCode::InternalError, None, "Failed to serialize response", cors);
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(json)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    cors.apply(response.headers_mut());
    response
}

/// `scheme://host` as the client sees this gateway
fn public_base_url(req: &Request<Incoming>) -> String {
    let proto = req
        .headers()
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string());

    format!("{}://{}", proto, host)
}

fn index_response(req: &Request<Incoming>, state: &GatewayState) -> Response<ProxyBody> {
    let base = public_base_url(req);
    let servers = state
        .routes
        .iter()
        .map(|route| IndexServer {
            name: route.name.clone(),
            sse_url: format!("{}/{}{}", base, route.name, state.sse_path),
            message_url: format!("{}/{}{}", base, route.name, state.message_path),
            status: state.status_of(&route.name),
        })
        .collect();

    let body = IndexBody {
        name: state.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        servers,
    };
    json_response(StatusCode::OK, &body, &state.cors)
}

fn health_response(state: &GatewayState) -> Response<ProxyBody> {
    let servers: Vec<HealthServer> = state
        .routes
        .iter()
        .map(|route| HealthServer {
            name: route.name.clone(),
            port: route.port,
            status: state.status_of(&route.name),
        })
        .collect();

    let all_ready = servers.iter().all(|s| s.status == BackendStatus::Ready);
    let body = HealthBody {
        status: if all_ready { "ok" } else { "starting" },
        servers,
    };
    json_response(StatusCode::OK, &body, &state.cors)
}
