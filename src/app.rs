//! Composition root: wires configuration into a running gateway

use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::{GatewayServer, GatewayState};
use crate::headers::CorsPolicy;
use crate::process::{ProcessSupervisor, SupervisorRegistry};
use crate::proxy::StreamingProxy;
use crate::routes::RouteTable;
use crate::shutdown::{ShutdownCoordinator, ShutdownHandle, ShutdownReason};
use crate::upstream::UpstreamClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A started gateway
pub struct RunningGateway {
    local_addr: SocketAddr,
    handle: ShutdownHandle,
    registry: Arc<SupervisorRegistry>,
    coordinator: JoinHandle<u8>,
}

impl RunningGateway {
    /// Address the public listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Arc<SupervisorRegistry> {
        &self.registry
    }

    /// Wait for shutdown to finish and return the exit code
    pub async fn wait(self) -> u8 {
        match self.coordinator.await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Shutdown coordinator failed");
                1
            }
        }
    }
}

/// Bind the public listener, launch every backend and start serving.
///
/// The listener accepts traffic right away; routes whose backend is not
/// ready answer `503` until it is. `handle` is created by the caller so
/// signal handlers can be in place before any backend is spawned; if it is
/// already triggered, the backends are stopped as soon as they launch.
pub async fn start(config: Config, handle: ShutdownHandle) -> anyhow::Result<RunningGateway> {
    let servers = config.server_configs()?;
    let addr = config.gateway.listen_addr()?;
    let cors = CorsPolicy::new(&config.gateway.cors_origin)
        .map_err(|e| GatewayError::Config(format!("invalid cors_origin: {}", e)))?;
    let routes = RouteTable::from_servers(&servers, &config.gateway.backend_host)?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = ProcessSupervisor::new(
        &config.gateway.backend_host,
        config.readiness.clone(),
        events_tx,
    );
    let registry = Arc::new(SupervisorRegistry::launch(&supervisor, servers));

    let (listener_tx, listener_rx) = watch::channel(false);
    let coordinator = ShutdownCoordinator::new(
        handle.clone(),
        Arc::clone(&registry),
        listener_tx,
        config.gateway.shutdown_grace_period(),
        config.gateway.startup_policy,
        events_rx,
    );

    let state = Arc::new(GatewayState {
        name: config.gateway.name.clone(),
        routes,
        registry: Arc::clone(&registry),
        proxy: StreamingProxy::new(
            UpstreamClient::new(&config.upstream),
            cors.clone(),
            &config.gateway.sse_path,
        ),
        cors,
        sse_path: config.gateway.sse_path.clone(),
        message_path: config.gateway.message_path.clone(),
    });

    let server = GatewayServer::new(listener, state, listener_rx);
    info!(addr = %local_addr, servers = registry.len(), "Gateway listening (HTTP/1.1 and HTTP/2)");

    let server_task = tokio::spawn(server.run());
    let watcher = handle.clone();
    tokio::spawn(async move {
        let reason = match server_task.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("listener failed: {:#}", e),
            Err(e) => format!("listener task failed: {}", e),
        };
        watcher.trigger(ShutdownReason::Fatal(reason));
    });

    let coordinator = tokio::spawn(coordinator.run());

    Ok(RunningGateway {
        local_addr,
        handle,
        registry,
        coordinator,
    })
}
