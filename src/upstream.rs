//! Pooled HTTP client for backend connections
//!
//! Connections to backends are reused across exchanges. Sockets disable
//! Nagle's algorithm so small event frames are not held back.

use crate::config::UpstreamSettings;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tracing::debug;

/// Errors raised before a backend response starts
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("{0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid outbound request: {0}")]
    Request(String),
}

impl UpstreamError {
    /// Innermost cause, which is usually the useful one (e.g. connection refused)
    pub fn root_cause(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        while let Some(source) = current.source() {
            current = source;
        }
        current.to_string()
    }
}

/// Pooled client over plain TCP
pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
}

impl UpstreamClient {
    pub fn new(settings: &UpstreamSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_keepalive(Some(settings.tcp_keepalive()));
        connector.set_connect_timeout(Some(settings.connect_timeout()));
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .pool_idle_timeout(settings.pool_idle_timeout())
            .pool_timer(TokioTimer::new())
            .build(connector);

        debug!(
            max_idle = settings.pool_max_idle_per_host,
            idle_timeout_secs = settings.pool_idle_timeout_secs,
            connect_timeout_ms = settings.connect_timeout_ms,
            "Upstream client initialized"
        );

        Self { client }
    }

    /// Send a fully built outbound request; resolves once response headers arrive
    pub async fn send(&self, req: Request<Incoming>) -> Result<Response<Incoming>, UpstreamError> {
        Ok(self.client.request(req).await?)
    }
}
