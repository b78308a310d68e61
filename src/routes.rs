//! Name-prefixed routing from public paths to backend targets

use crate::config::ServerConfig;
use crate::error::GatewayError;
use std::collections::HashMap;

/// One configured route: `/{name}/...` goes to `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl RouteEntry {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute<'a> {
    pub route: &'a RouteEntry,
    /// Path with the route segment removed, always starting with `/`
    pub remainder: String,
}

impl ResolvedRoute<'_> {
    /// Target path with the client's query string appended verbatim
    pub fn path_and_query(&self, query: Option<&str>) -> String {
        match query {
            Some(q) => format!("{}?{}", self.remainder, q),
            None => self.remainder.clone(),
        }
    }
}

/// Immutable route table, built once at startup
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, RouteEntry>,
    order: Vec<String>,
}

impl RouteTable {
    pub fn from_servers(servers: &[ServerConfig], host: &str) -> Result<Self, GatewayError> {
        let mut table = Self::default();

        for server in servers {
            if server.name.is_empty() || server.name.contains('/') {
                return Err(GatewayError::Config(format!(
                    "invalid route name '{}'",
                    server.name
                )));
            }
            if table.routes.contains_key(&server.name) {
                return Err(GatewayError::Config(format!(
                    "duplicate route name '{}'",
                    server.name
                )));
            }

            table.order.push(server.name.clone());
            table.routes.insert(
                server.name.clone(),
                RouteEntry {
                    name: server.name.clone(),
                    host: host.to_string(),
                    port: server.port,
                },
            );
        }

        Ok(table)
    }

    /// Match the first path segment exactly against a route name
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute<'_>> {
        let trimmed = path.strip_prefix('/')?;
        let (segment, rest) = match trimmed.find('/') {
            Some(idx) => trimmed.split_at(idx),
            None => (trimmed, ""),
        };

        if segment.is_empty() {
            return None;
        }

        let route = self.routes.get(segment)?;
        let remainder = if rest.is_empty() { "/" } else { rest };

        Some(ResolvedRoute {
            route,
            remainder: remainder.to_string(),
        })
    }

    /// Routes in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.order.iter().filter_map(|name| self.routes.get(name))
    }
}
