//! Backend process supervision
//!
//! Every configured server runs as a child process in its own process
//! group. Three tasks follow each child: output capture, exit monitoring
//! and readiness polling. Status only moves forward through
//! [`BackendStatus::can_transition_to`].

use crate::config::{ReadinessSettings, ServerConfig};
use crate::error::GatewayError;
use crate::readiness::ReadinessProbe;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Spawned, port not yet accepting connections
    Starting,
    /// Port accepts connections; traffic is routed
    Ready,
    /// Failed to spawn, never became ready, or exited abnormally
    Error,
    /// Exited cleanly or was stopped by the gateway
    Stopped,
}

impl BackendStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BackendStatus::Error | BackendStatus::Stopped)
    }

    /// `Starting → Ready → {Stopped, Error}`, with `Starting` allowed to skip `Ready`
    pub fn can_transition_to(self, next: BackendStatus) -> bool {
        use BackendStatus::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Starting, Error) | (Starting, Stopped) | (Ready, Error) | (Ready, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendStatus::Starting => "starting",
            BackendStatus::Ready => "ready",
            BackendStatus::Error => "error",
            BackendStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals the gateway sends to backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Notifications from supervised processes, consumed by the shutdown coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Ready {
        name: String,
    },
    /// Spawn failure or readiness timeout
    StartupFailed {
        name: String,
        error: String,
    },
    Exited {
        name: String,
        code: Option<i32>,
        signal: Option<i32>,
        status: BackendStatus,
        /// The gateway asked the process to stop
        expected: bool,
        /// The process never reached `Ready`
        during_startup: bool,
    },
}

/// One supervised backend.
///
/// Status is only changed through [`BackendProcess::transition`], which
/// enforces the lifecycle order; readers take the latest value.
pub struct BackendProcess {
    config: ServerConfig,
    status: watch::Sender<BackendStatus>,
    /// `true` until the OS process has been reaped
    alive: watch::Sender<bool>,
    /// Signal requests for the task that owns the `Child`
    control: Option<mpsc::UnboundedSender<Signal>>,
    /// Poked when output matches `ready_pattern`
    ready_hint: Notify,
    pid: Option<u32>,
}

impl BackendProcess {
    /// A backend that never got an OS process
    fn failed(config: ServerConfig) -> Self {
        Self {
            config,
            status: watch::channel(BackendStatus::Error).0,
            alive: watch::channel(false).0,
            control: None,
            ready_hint: Notify::new(),
            pid: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn status(&self) -> BackendStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BackendStatus> {
        self.status.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Apply a lifecycle transition; returns false if it is not allowed
    pub fn transition(&self, next: BackendStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Ask the process to stop. A no-op once it has exited.
    pub fn terminate(&self, signal: Signal) -> bool {
        if !self.is_alive() {
            return false;
        }
        match &self.control {
            Some(control) => control.send(signal).is_ok(),
            None => false,
        }
    }

    /// Resolves once the OS process has been reaped
    pub async fn wait_exited(&self) {
        let mut alive = self.alive.subscribe();
        while *alive.borrow_and_update() {
            if alive.changed().await.is_err() {
                break;
            }
        }
    }
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess")
            .field("name", &self.config.name)
            .field("port", &self.config.port)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

/// Spawns backends and runs their output, exit and readiness tasks
pub struct ProcessSupervisor {
    backend_host: String,
    readiness: ReadinessSettings,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        backend_host: &str,
        readiness: ReadinessSettings,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        Self {
            backend_host: backend_host.to_string(),
            readiness,
            events,
        }
    }

    /// Launch one backend. Must be called from within a Tokio runtime.
    pub fn spawn(&self, config: ServerConfig) -> Result<Arc<BackendProcess>, GatewayError> {
        let name = config.name.clone();
        info!(server = %name, command = %config.display_command(), port = config.port, "Starting backend");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);
        cmd.env("PORT", config.port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own group, so signals reach the wrappers' grandchildren too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| GatewayError::Spawn {
            name: name.clone(),
            command: config.command.clone(),
            source,
        })?;

        let pid = child.id();
        info!(server = %name, pid, "Backend process spawned");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let probe = ReadinessProbe::new(&self.backend_host, config.port, &self.readiness);

        let process = Arc::new(BackendProcess {
            config,
            status: watch::channel(BackendStatus::Starting).0,
            alive: watch::channel(true).0,
            control: Some(control_tx),
            ready_hint: Notify::new(),
            pid,
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_output(Arc::clone(&process), stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_output(Arc::clone(&process), stderr, "stderr"));
        }

        tokio::spawn(monitor_exit(
            Arc::clone(&process),
            child,
            control_rx,
            self.events.clone(),
        ));
        tokio::spawn(watch_readiness(
            Arc::clone(&process),
            probe,
            self.events.clone(),
        ));

        Ok(process)
    }

    fn report(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }
}

/// Forward output lines to the log, tagged with the server name
async fn capture_output<R>(process: Arc<BackendProcess>, reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }

                if stream == "stderr" {
                    warn!(server = %process.name(), stream, "{}", line);
                } else {
                    info!(server = %process.name(), stream, "{}", line);
                }

                let matches_ready = process
                    .config
                    .ready_pattern
                    .as_deref()
                    .map(|pattern| line.contains(pattern))
                    .unwrap_or(false);
                if matches_ready && process.status() == BackendStatus::Starting {
                    process.ready_hint.notify_one();
                }
            }
            Err(e) => {
                debug!(server = %process.name(), stream, error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}

/// Own the `Child`: deliver signal requests and record the exit
async fn monitor_exit(
    process: Arc<BackendProcess>,
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let name = process.name().to_string();
    let mut expected = false;

    let result = loop {
        tokio::select! {
            result = child.wait() => break result,
            Some(signal) = control.recv() => {
                expected = true;
                debug!(server = %name, ?signal, pid = process.pid, "Signaling backend");
                if let Err(e) = deliver_signal(&mut child, signal) {
                    warn!(server = %name, ?signal, error = %e, "Failed to signal backend");
                }
            }
        }
    };

    let during_startup = process.status() == BackendStatus::Starting;

    let (code, signal) = match result {
        Ok(status) => {
            let (code, signal) = exit_details(&status);
            let next = if expected || status.success() {
                BackendStatus::Stopped
            } else {
                BackendStatus::Error
            };
            process.transition(next);

            if expected {
                info!(server = %name, ?code, ?signal, "Backend process exited");
            } else {
                let err = GatewayError::ProcessExited {
                    name: name.clone(),
                    detail: describe_exit(code, signal),
                };
                warn!(server = %name, ?code, ?signal, "{}", err);
            }
            (code, signal)
        }
        Err(e) => {
            error!(server = %name, error = %e, "Failed to wait for backend process");
            process.transition(BackendStatus::Error);
            (None, None)
        }
    };

    process.alive.send_replace(false);

    let _ = events.send(BackendEvent::Exited {
        name,
        code,
        signal,
        status: process.status(),
        expected,
        during_startup,
    });
}

/// Probe the port until ready, unless the process leaves `Starting` first
async fn watch_readiness(
    process: Arc<BackendProcess>,
    probe: ReadinessProbe,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let mut status = process.subscribe_status();
    let left_starting = async {
        while *status.borrow_and_update() == BackendStatus::Starting {
            if status.changed().await.is_err() {
                break;
            }
        }
    };

    let outcome = tokio::select! {
        result = probe.wait_ready(&process.ready_hint) => Some(result),
        _ = left_starting => None,
    };

    match outcome {
        Some(Ok(attempts)) => {
            if process.transition(BackendStatus::Ready) {
                info!(server = %process.name(), port = probe.port(), attempts, "Backend is now ready");
                let _ = events.send(BackendEvent::Ready {
                    name: process.name().to_string(),
                });
            }
        }
        Some(Err(e)) => {
            if process.transition(BackendStatus::Error) {
                error!(server = %process.name(), error = %e, "Backend failed to become ready");
                process.terminate(Signal::Terminate);
                let _ = events.send(BackendEvent::StartupFailed {
                    name: process.name().to_string(),
                    error: e.to_string(),
                });
            }
        }
        None => {
            debug!(server = %process.name(), status = %process.status(), "Readiness polling stopped");
        }
    }
}

/// Signal the child's whole process group, falling back to the child alone
#[cfg(unix)]
fn deliver_signal(child: &mut Child, signal: Signal) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };
    let pid = pid as libc::pid_t;
    if unsafe { libc::killpg(pid, signal.as_raw()) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signal.as_raw()) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut Child, _signal: Signal) -> std::io::Result<()> {
    child.start_kill()
}

fn exit_details(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(status);
    #[cfg(not(unix))]
    let signal = None;
    (status.code(), signal)
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}

/// All supervised backends, owned by the composition root.
///
/// The set of backends is fixed at launch; only their status changes.
#[derive(Debug, Default)]
pub struct SupervisorRegistry {
    backends: Vec<Arc<BackendProcess>>,
}

impl SupervisorRegistry {
    /// Spawn every configured backend. Spawn failures are reported on the
    /// event channel and leave the backend in `Error`.
    pub fn launch(supervisor: &ProcessSupervisor, configs: Vec<ServerConfig>) -> Self {
        let backends = configs
            .into_iter()
            .map(|config| match supervisor.spawn(config.clone()) {
                Ok(process) => process,
                Err(e) => {
                    error!(server = %config.name, error = %e, "Failed to spawn backend");
                    supervisor.report(BackendEvent::StartupFailed {
                        name: config.name.clone(),
                        error: e.to_string(),
                    });
                    Arc::new(BackendProcess::failed(config))
                }
            })
            .collect();

        Self { backends }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<BackendProcess>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn status(&self, name: &str) -> Option<BackendStatus> {
        self.get(name).map(|b| b.status())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendProcess>> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn all_ready(&self) -> bool {
        self.backends
            .iter()
            .all(|b| b.status() == BackendStatus::Ready)
    }

    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    /// Signal every backend still running; returns how many were signaled
    pub fn terminate_all(&self, signal: Signal) -> usize {
        self.backends
            .iter()
            .filter(|b| b.terminate(signal))
            .count()
    }

    pub async fn wait_all_exited(&self) {
        for backend in &self.backends {
            backend.wait_exited().await;
        }
    }
}
