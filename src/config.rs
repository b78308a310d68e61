use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "bridgegate.toml";

/// Path segment reserved for the aggregated readiness endpoint
pub const RESERVED_ROUTE_NAMES: &[&str] = &["health"];

/// Top-level gateway configuration, as read from the TOML file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener and routing settings
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Backend readiness polling
    #[serde(default)]
    pub readiness: ReadinessSettings,

    /// Outbound connection settings for proxied traffic
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Template used to wrap stdio-only servers into an HTTP bridge
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Backends, in declaration order
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// What to do when a backend fails to spawn or never becomes reachable
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartupPolicy {
    /// Keep serving; the failed route answers 503
    #[default]
    Degrade,
    /// Stop every backend and exit non-zero
    Abort,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    /// Name reported by `GET /`
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public port (default: 8000, overridden by `PORT`)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Host the backends listen on
    #[serde(default = "default_backend_host")]
    pub backend_host: String,

    /// First port handed out to servers without an explicit port
    #[serde(default = "default_backend_port_base")]
    pub backend_port_base: u16,

    /// Value of `Access-Control-Allow-Origin`
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,

    /// Backend path of the event-stream endpoint
    #[serde(default = "default_sse_path")]
    pub sse_path: String,

    /// Backend path that accepts client messages
    #[serde(default = "default_message_path")]
    pub message_path: String,

    #[serde(default)]
    pub startup_policy: StartupPolicy,

    /// How long shutdown waits for backends before giving up on them
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,
}

impl GatewaySettings {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            bind: default_bind_address(),
            port: default_listen_port(),
            backend_host: default_backend_host(),
            backend_port_base: default_backend_port_base(),
            cors_origin: default_cors_origin(),
            sse_path: default_sse_path(),
            message_path: default_message_path(),
            startup_policy: StartupPolicy::default(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessSettings {
    /// Timeout of a single TCP connect attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Pause between failed attempts
    #[serde(default = "default_probe_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ReadinessSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout(),
            interval_ms: default_probe_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// TCP keep-alive interval on backend connections
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl UpstreamSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tcp_keepalive(&self) -> Duration {
        Duration::from_secs(self.tcp_keepalive_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Command line that turns a stdio server into an HTTP+SSE endpoint.
///
/// `{stdio}`, `{port}` and `{name}` in `args` are replaced per server.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeSettings {
    #[serde(default = "default_bridge_command")]
    pub command: String,

    #[serde(default = "default_bridge_args")]
    pub args: Vec<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: default_bridge_args(),
        }
    }
}

/// A `[[servers]]` entry as written in the file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerEntry {
    /// Route name, also the first path segment
    pub name: String,

    /// Local port; assigned from `backend_port_base` when omitted
    pub port: Option<u16>,

    /// Executable of an already-HTTP backend
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Command line of a stdio-only server, wrapped by `[bridge]`
    pub stdio: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Output text that means the backend is about to accept connections
    pub ready_pattern: Option<String>,
}

/// Fully resolved backend definition consumed by the supervisor
///
/// # Security Warning
///
/// `command` and `args` are executed as-is with the permissions of the
/// gateway. Configuration files must come from a trusted source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub port: u16,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub ready_pattern: Option<String>,
}

impl ServerConfig {
    pub fn new(name: &str, port: u16, command: &str) -> Self {
        Self {
            name: name.to_string(),
            port,
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            ready_pattern: None,
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one environment variable (builder pattern)
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the readiness hint pattern (builder pattern)
    pub fn with_ready_pattern(mut self, pattern: &str) -> Self {
        self.ready_pattern = Some(pattern.to_string());
        self
    }

    /// Command line for logs
    pub fn display_command(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.command.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

// Default value functions
fn default_gateway_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port_base() -> u16 {
    8100
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_sse_path() -> String {
    "/sse".to_string()
}

fn default_message_path() -> String {
    "/message".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    2000
}

fn default_attempt_timeout() -> u64 {
    1000
}

fn default_probe_interval() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    60
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_tcp_keepalive() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_bridge_command() -> String {
    "npx".to_string()
}

fn default_bridge_args() -> Vec<String> {
    [
        "-y",
        "supergateway",
        "--stdio",
        "{stdio}",
        "--port",
        "{port}",
        "--cors",
        "--logLevel",
        "info",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Config file location: explicit argument, else `BRIDGEGATE_CONFIG`, else `bridgegate.toml`
pub fn config_path(arg: Option<String>, lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    arg.filter(|a| !a.is_empty())
        .or_else(|| lookup("BRIDGEGATE_CONFIG").filter(|v| !v.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let lookup = |name: &str| std::env::var(name).ok();
        let mut config = Self::from_toml_str(&content, &lookup)?;
        config.apply_env_overrides(&lookup);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document, substituting `${VAR}` / `${VAR:-default}` in every string
    pub fn from_toml_str(
        content: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut value = toml::Value::Table(table);

        let mut missing = Vec::new();
        interpolate_value(&mut value, lookup, &mut missing);
        missing.sort();
        missing.dedup();
        for name in &missing {
            warn!(variable = %name, "Configuration references unset variable, using empty string");
        }

        Ok(value.try_into::<Config>()?)
    }

    /// `PORT` overrides the public port
    pub fn apply_env_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("PORT") {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => warn!(value = %raw, "Ignoring non-numeric PORT"),
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        for (index, entry) in self.servers.iter().enumerate() {
            if let Err(e) = entry.validate(index) {
                errors.push(e);
            }
            if !entry.name.is_empty() && !names.insert(entry.name.as_str()) {
                errors.push(format!("Server '{}': duplicate name", entry.name));
            }
        }

        if let Err(e) = self.assign_ports() {
            errors.push(e);
        }

        if self.readiness.max_attempts == 0 {
            errors.push("readiness.max_attempts must be greater than 0".to_string());
        }
        if self.readiness.attempt_timeout_ms == 0 || self.readiness.interval_ms == 0 {
            errors.push("readiness timings must be greater than 0".to_string());
        }
        if let Err(e) = self.gateway.listen_addr() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Ports for every server, explicit ones kept and the rest handed out from the base
    fn assign_ports(&self) -> Result<Vec<u16>, String> {
        let mut taken: HashSet<u16> = HashSet::new();
        taken.insert(self.gateway.port);

        for entry in &self.servers {
            if let Some(port) = entry.port {
                if port == 0 {
                    return Err(format!("Server '{}': 'port' must be greater than 0", entry.name));
                }
                if !taken.insert(port) {
                    return Err(format!(
                        "Server '{}': port {} is already in use by the gateway or another server",
                        entry.name, port
                    ));
                }
            }
        }

        let mut next = self.gateway.backend_port_base;
        let mut ports = Vec::with_capacity(self.servers.len());
        for entry in &self.servers {
            let port = match entry.port {
                Some(port) => port,
                None => {
                    while next == 0 || taken.contains(&next) {
                        next = next.checked_add(1).ok_or_else(|| {
                            format!("Server '{}': ran out of ports to assign", entry.name)
                        })?;
                    }
                    taken.insert(next);
                    next
                }
            };
            ports.push(port);
        }
        Ok(ports)
    }

    /// Resolve the `[[servers]]` list into supervisor input, in file order
    pub fn server_configs(&self) -> anyhow::Result<Vec<ServerConfig>> {
        let ports = self.assign_ports().map_err(|e| anyhow::anyhow!(e))?;

        self.servers
            .iter()
            .zip(ports)
            .map(|(entry, port)| entry.resolve(port, &self.bridge))
            .collect()
    }
}

impl ServerEntry {
    fn validate(&self, index: usize) -> Result<(), String> {
        if self.name.is_empty() {
            return Err(format!("Server #{}: 'name' must not be empty", index + 1));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(format!(
                "Server '{}': name may only contain letters, digits, '-', '_' and '.'",
                self.name
            ));
        }
        if RESERVED_ROUTE_NAMES.contains(&self.name.as_str()) {
            return Err(format!("Server '{}': name is reserved", self.name));
        }

        match (&self.command, &self.stdio) {
            (Some(_), Some(_)) => Err(format!(
                "Server '{}': set either 'command' or 'stdio', not both",
                self.name
            )),
            (None, None) => Err(format!(
                "Server '{}': requires 'command' or 'stdio' field",
                self.name
            )),
            (Some(command), None) if command.trim().is_empty() => {
                Err(format!("Server '{}': 'command' must not be empty", self.name))
            }
            (None, Some(stdio)) => match shell_words::split(stdio) {
                Ok(words) if !words.is_empty() => Ok(()),
                Ok(_) => Err(format!("Server '{}': 'stdio' must not be empty", self.name)),
                Err(e) => Err(format!("Server '{}': invalid 'stdio' command line: {}", self.name, e)),
            },
            _ => Ok(()),
        }
    }

    fn resolve(&self, port: u16, bridge: &BridgeSettings) -> anyhow::Result<ServerConfig> {
        let stdio = self.stdio.as_deref().unwrap_or("");
        let (command, args) = match &self.command {
            Some(command) => (command.clone(), &self.args),
            None => (bridge.command.clone(), &bridge.args),
        };

        if command.is_empty() {
            anyhow::bail!("Server '{}': resolved an empty command", self.name);
        }

        Ok(ServerConfig {
            name: self.name.clone(),
            port,
            command,
            args: args
                .iter()
                .map(|arg| expand_placeholders(arg, &self.name, port, stdio))
                .collect(),
            env: self.env.clone(),
            ready_pattern: self.ready_pattern.clone(),
        })
    }
}

fn expand_placeholders(arg: &str, name: &str, port: u16, stdio: &str) -> String {
    arg.replace("{name}", name)
        .replace("{port}", &port.to_string())
        .replace("{stdio}", stdio)
}

fn interpolate_value(
    value: &mut toml::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
    missing: &mut Vec<String>,
) {
    match value {
        toml::Value::String(s) => *s = interpolate(s, lookup, missing),
        toml::Value::Array(items) => {
            for item in items.iter_mut() {
                interpolate_value(item, lookup, missing);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                interpolate_value(item, lookup, missing);
            }
        }
        _ => {}
    }
}

/// Expand `${VAR}` and `${VAR:-default}`; `$$` is a literal `$`.
///
/// Names of unset variables without a default are pushed to `missing`.
pub fn interpolate(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    missing: &mut Vec<String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
            continue;
        }

        let Some(body) = after.strip_prefix('{') else {
            out.push('$');
            rest = after;
            continue;
        };

        let Some(end) = body.find('}') else {
            // Unterminated reference, keep it verbatim
            out.push_str(&rest[pos..]);
            return out;
        };

        let expr = &body[..end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        match (lookup(name), default) {
            (Some(value), Some(default)) if value.is_empty() => out.push_str(default),
            (Some(value), _) => out.push_str(&value),
            (None, Some(default)) => out.push_str(default),
            (None, None) => missing.push(name.to_string()),
        }

        rest = &body[end + 1..];
    }

    out.push_str(rest);
    out
}
