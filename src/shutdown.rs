//! Ordered shutdown: `Running -> Stopping -> Stopped`
//!
//! A signal or a fatal error moves the gateway to `Stopping` exactly once.
//! The coordinator then closes the listener, signals every live backend,
//! waits out the grace period and kills whatever is left.

use crate::config::StartupPolicy;
use crate::process::{BackendEvent, BackendStatus, Signal, SupervisorRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for reaping after SIGKILL
const KILL_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Termination signal, by name
    Signal(&'static str),
    /// Unrecoverable error; the gateway exits non-zero
    Fatal(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownReason::Signal(_) => 0,
            ShutdownReason::Fatal(_) => 1,
        }
    }

    /// Signal to relay to backends: an interrupt stays an interrupt,
    /// everything else asks them to terminate
    pub fn backend_signal(&self) -> Signal {
        match self {
            ShutdownReason::Signal("SIGINT") => Signal::Interrupt,
            _ => Signal::Terminate,
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::Fatal(message) => write!(f, "fatal error: {}", message),
        }
    }
}

struct Shared {
    phase: watch::Sender<ShutdownPhase>,
    reason: Mutex<Option<ShutdownReason>>,
}

/// Cloneable trigger for shutdown, handed to signal handlers and watchers
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// A handle in the `Running` phase
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                phase: watch::channel(ShutdownPhase::Running).0,
                reason: Mutex::new(None),
            }),
        }
    }

    /// Start shutting down. Only the first call has any effect.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let mut slot = self.shared.reason.lock();
        if let Some(current) = slot.as_ref() {
            debug!(ignored = %reason, current = %current, "Shutdown already in progress");
            return false;
        }

        match &reason {
            ShutdownReason::Signal(_) => info!(reason = %reason, "Shutting down"),
            ShutdownReason::Fatal(_) => error!(reason = %reason, "Shutting down"),
        }
        *slot = Some(reason);
        self.shared.phase.send_replace(ShutdownPhase::Stopping);
        true
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.shared.phase.borrow()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.shared.reason.lock().clone()
    }

    fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.shared.phase.subscribe()
    }

    fn mark_stopped(&self) {
        self.shared.phase.send_replace(ShutdownPhase::Stopped);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("phase", &self.phase())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Watches backend events while running and drives the stop sequence
pub struct ShutdownCoordinator {
    registry: Arc<SupervisorRegistry>,
    listener: watch::Sender<bool>,
    grace: Duration,
    policy: StartupPolicy,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    handle: ShutdownHandle,
}

impl ShutdownCoordinator {
    /// `handle` may already be triggered, in which case `run` goes straight
    /// to the stop sequence
    pub fn new(
        handle: ShutdownHandle,
        registry: Arc<SupervisorRegistry>,
        listener: watch::Sender<bool>,
        grace: Duration,
        policy: StartupPolicy,
        events: mpsc::UnboundedReceiver<BackendEvent>,
    ) -> Self {
        Self {
            registry,
            listener,
            grace,
            policy,
            events,
            handle,
        }
    }

    /// Run until shutdown completes; returns the process exit code
    pub async fn run(mut self) -> u8 {
        let mut phase = self.handle.subscribe();
        let mut events_open = true;

        while *phase.borrow_and_update() == ShutdownPhase::Running {
            tokio::select! {
                changed = phase.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = self.events.recv(), if events_open => {
                    match event {
                        Some(event) => self.on_event(event),
                        None => events_open = false,
                    }
                }
            }
        }

        self.stop_all().await;

        let code = self.handle.reason().map(|r| r.exit_code()).unwrap_or(0);
        self.handle.mark_stopped();
        info!(exit_code = code, "Shutdown complete");
        code
    }

    fn on_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Ready { name } => {
                debug!(server = %name, "Backend ready");
                if self.registry.all_ready() {
                    info!(servers = self.registry.len(), "All backends ready");
                }
            }
            BackendEvent::StartupFailed { name, error } => self.on_startup_failure(&name, &error),
            BackendEvent::Exited {
                name,
                code,
                signal,
                status,
                expected,
                during_startup,
            } => {
                if expected {
                    return;
                }
                if during_startup {
                    let detail = match (code, signal) {
                        (Some(code), _) => format!("exited with code {} before becoming ready", code),
                        (None, Some(signal)) => format!("killed by signal {} before becoming ready", signal),
                        (None, None) => "exited before becoming ready".to_string(),
                    };
                    self.on_startup_failure(&name, &detail);
                } else if status == BackendStatus::Error {
                    warn!(server = %name, ?code, ?signal, "Route unavailable until the gateway is restarted");
                } else {
                    info!(server = %name, "Backend exited on its own, route unavailable");
                }
            }
        }
    }

    fn on_startup_failure(&self, name: &str, error: &str) {
        match self.policy {
            StartupPolicy::Abort => {
                self.handle.trigger(ShutdownReason::Fatal(format!(
                    "server '{}' failed to start: {}",
                    name, error
                )));
            }
            StartupPolicy::Degrade => {
                warn!(server = %name, error, "Server failed to start, continuing without it");
            }
        }
    }

    async fn stop_all(&self) {
        let _ = self.listener.send(true);

        let signal = self
            .handle
            .reason()
            .map(|r| r.backend_signal())
            .unwrap_or(Signal::Terminate);
        let signaled = self.registry.terminate_all(signal);
        info!(
            signaled,
            ?signal,
            grace_period_ms = self.grace.as_millis() as u64,
            "Signaled backends to stop"
        );

        if tokio::time::timeout(self.grace, self.registry.wait_all_exited())
            .await
            .is_err()
        {
            let remaining = self.registry.alive_count();
            warn!(remaining, "Grace period elapsed, killing remaining backends");
            self.registry.terminate_all(Signal::Kill);
            if tokio::time::timeout(KILL_WAIT, self.registry.wait_all_exited())
                .await
                .is_err()
            {
                warn!(remaining = self.registry.alive_count(), "Some backends did not exit after SIGKILL");
            }
        }
    }
}

/// Turn SIGINT/SIGTERM into shutdown triggers. Repeated signals are ignored.
#[cfg(unix)]
pub fn install_signal_handlers(handle: ShutdownHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigint.recv() => "SIGINT",
                else => break,
            };
            handle.trigger(ShutdownReason::Signal(name));
        }
    }))
}

#[cfg(not(unix))]
pub fn install_signal_handlers(handle: ShutdownHandle) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            handle.trigger(ShutdownReason::Signal("Ctrl+C"));
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReadinessSettings, ServerConfig};
    use crate::process::ProcessSupervisor;

    fn coordinator(
        configs: Vec<ServerConfig>,
        policy: StartupPolicy,
        grace: Duration,
    ) -> (ShutdownCoordinator, ShutdownHandle, Arc<SupervisorRegistry>, watch::Receiver<bool>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let readiness = ReadinessSettings {
            attempt_timeout_ms: 100,
            interval_ms: 50,
            max_attempts: 400,
        };
        let supervisor = ProcessSupervisor::new("127.0.0.1", readiness, events_tx);
        let registry = Arc::new(SupervisorRegistry::launch(&supervisor, configs));
        let (listener_tx, listener_rx) = watch::channel(false);
        let handle = ShutdownHandle::new();
        let coordinator = ShutdownCoordinator::new(
            handle.clone(),
            Arc::clone(&registry),
            listener_tx,
            grace,
            policy,
            events_rx,
        );
        (coordinator, handle, registry, listener_rx)
    }

    #[test]
    fn test_trigger_is_first_wins() {
        let handle = ShutdownHandle::new();
        assert_eq!(handle.phase(), ShutdownPhase::Running);

        assert!(handle.trigger(ShutdownReason::Signal("SIGTERM")));
        assert!(!handle.trigger(ShutdownReason::Fatal("late".to_string())));
        assert!(!handle.trigger(ShutdownReason::Signal("SIGINT")));

        assert_eq!(handle.phase(), ShutdownPhase::Stopping);
        assert_eq!(handle.reason(), Some(ShutdownReason::Signal("SIGTERM")));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownReason::Signal("SIGTERM").exit_code(), 0);
        assert_eq!(ShutdownReason::Fatal("boom".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_backend_signal_follows_reason() {
        assert_eq!(ShutdownReason::Signal("SIGINT").backend_signal(), Signal::Interrupt);
        assert_eq!(ShutdownReason::Signal("SIGTERM").backend_signal(), Signal::Terminate);
        assert_eq!(ShutdownReason::Fatal("boom".to_string()).backend_signal(), Signal::Terminate);
    }

    #[tokio::test]
    async fn test_shutdown_without_backends() {
        let (coordinator, handle, _registry, listener_rx) =
            coordinator(Vec::new(), StartupPolicy::Degrade, Duration::from_millis(100));
        let task = tokio::spawn(coordinator.run());

        handle.trigger(ShutdownReason::Signal("SIGTERM"));
        let code = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, 0);
        assert!(*listener_rx.borrow());
        assert_eq!(handle.phase(), ShutdownPhase::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_stops_backends() {
        let configs = vec![
            ServerConfig::new("a", 1, "sleep").with_args(["30"]),
            ServerConfig::new("b", 2, "sleep").with_args(["30"]),
        ];
        let (coordinator, handle, registry, _listener_rx) =
            coordinator(configs, StartupPolicy::Degrade, Duration::from_secs(2));
        let task = tokio::spawn(coordinator.run());

        handle.trigger(ShutdownReason::Signal("SIGTERM"));
        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(registry.alive_count(), 0);
        assert_eq!(registry.status("a"), Some(BackendStatus::Stopped));
        assert_eq!(registry.status("b"), Some(BackendStatus::Stopped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_grace_period_escalates_to_kill() {
        let configs = vec![ServerConfig::new("stubborn", 1, "sh")
            .with_args(["-c", "trap '' TERM; while true; do sleep 0.1; done"])];
        let (coordinator, handle, registry, _listener_rx) =
            coordinator(configs, StartupPolicy::Degrade, Duration::from_millis(300));
        let task = tokio::spawn(coordinator.run());

        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = std::time::Instant::now();
        handle.trigger(ShutdownReason::Signal("SIGTERM"));
        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, 0);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(registry.alive_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_is_forwarded_to_backends() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("signal.txt");
        let script = format!(
            "trap 'echo INT > {0}; exit 0' INT; trap 'echo TERM > {0}; exit 0' TERM; while true; do sleep 0.1; done",
            marker.display()
        );
        let configs = vec![ServerConfig::new("trapper", 1, "sh").with_args(["-c", script.as_str()])];
        let (coordinator, handle, registry, _listener_rx) =
            coordinator(configs, StartupPolicy::Degrade, Duration::from_secs(2));
        let task = tokio::spawn(coordinator.run());

        // Let the shell install its traps
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.trigger(ShutdownReason::Signal("SIGINT"));
        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(registry.alive_count(), 0);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "INT");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_trigger_before_run_stops_backends() {
        let configs = vec![ServerConfig::new("early", 1, "sleep").with_args(["30"])];
        let (coordinator, handle, registry, listener_rx) =
            coordinator(configs, StartupPolicy::Degrade, Duration::from_secs(2));

        handle.trigger(ShutdownReason::Signal("SIGTERM"));
        let code = tokio::time::timeout(Duration::from_secs(5), coordinator.run())
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert!(*listener_rx.borrow());
        assert_eq!(registry.alive_count(), 0);
        assert_eq!(registry.status("early"), Some(BackendStatus::Stopped));
    }

    #[tokio::test]
    async fn test_abort_policy_spawn_failure_is_fatal() {
        let configs = vec![ServerConfig::new("ghost", 1, "/nonexistent/bridgegate-test-binary")];
        let (coordinator, handle, _registry, _listener_rx) =
            coordinator(configs, StartupPolicy::Abort, Duration::from_millis(100));

        let code = tokio::time::timeout(Duration::from_secs(2), coordinator.run())
            .await
            .unwrap();

        assert_eq!(code, 1);
        assert!(matches!(handle.reason(), Some(ShutdownReason::Fatal(ref m)) if m.contains("ghost")));
    }

    #[tokio::test]
    async fn test_degrade_policy_keeps_running() {
        let configs = vec![ServerConfig::new("ghost", 1, "/nonexistent/bridgegate-test-binary")];
        let (coordinator, handle, registry, _listener_rx) =
            coordinator(configs, StartupPolicy::Degrade, Duration::from_millis(100));
        let task = tokio::spawn(coordinator.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.phase(), ShutdownPhase::Running);
        assert_eq!(registry.status("ghost"), Some(BackendStatus::Error));

        handle.trigger(ShutdownReason::Signal("SIGINT"));
        let code = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }
}
