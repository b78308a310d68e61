//! Bridgegate - one HTTP/SSE port in front of many stdio protocol servers
//!
//! This library provides a gateway that:
//! - Launches one bridge process per configured server and supervises it
//! - Polls each backend port until it accepts connections
//! - Routes `/{name}/...` to the matching backend over a streaming reverse proxy
//! - Relays event streams frame by frame and injects CORS headers
//! - Stops every backend in order on SIGTERM/SIGINT or a fatal error

pub mod app;
pub mod config;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod routes;
pub mod shutdown;
pub mod upstream;
