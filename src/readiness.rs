//! TCP readiness probing for backend ports

use crate::config::ReadinessSettings;
use crate::error::GatewayError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

/// Polls a `host:port` until it accepts TCP connections.
///
/// Total wait is bounded by `max_attempts × (attempt_timeout + interval)`.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    host: String,
    port: u16,
    attempt_timeout: Duration,
    interval: Duration,
    max_attempts: u32,
}

impl ReadinessProbe {
    pub fn new(host: &str, port: u16, settings: &ReadinessSettings) -> Self {
        Self {
            host: host.to_string(),
            port,
            attempt_timeout: settings.attempt_timeout(),
            interval: settings.interval(),
            max_attempts: settings.max_attempts.max(1),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// One connect attempt; the connection is closed without sending data
    pub async fn probe_once(&self) -> bool {
        match tokio::time::timeout(
            self.attempt_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(port = self.port, error = %e, "Readiness probe refused");
                false
            }
            Err(_) => {
                debug!(port = self.port, "Readiness probe timed out");
                false
            }
        }
    }

    /// Probe until the port accepts connections.
    ///
    /// A notification on `hint` cuts the current pause short. Returns the
    /// number of attempts used.
    pub async fn wait_ready(&self, hint: &Notify) -> Result<u32, GatewayError> {
        for attempt in 1..=self.max_attempts {
            if self.probe_once().await {
                return Ok(attempt);
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = hint.notified() => {
                        debug!(port = self.port, "Ready hint received, probing early");
                    }
                }
            }
        }

        Err(GatewayError::ReadinessTimeout {
            port: self.port,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn settings(interval_ms: u64, max_attempts: u32) -> ReadinessSettings {
        ReadinessSettings {
            attempt_timeout_ms: 200,
            interval_ms,
            max_attempts,
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_ready_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = ReadinessProbe::new("127.0.0.1", port, &settings(100, 5));
        assert_eq!(probe.wait_ready(&Notify::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_port_and_attempts() {
        let port = free_port().await;
        let probe = ReadinessProbe::new("127.0.0.1", port, &settings(20, 3));

        match probe.wait_ready(&Notify::new()).await {
            Err(GatewayError::ReadinessTimeout { port: p, attempts }) => {
                assert_eq!(p, port);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected readiness timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_within_one_interval_of_listener_opening() {
        let port = free_port().await;
        let delay = Duration::from_millis(300);
        let interval = Duration::from_millis(100);

        let opened = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let opened_at = Instant::now();
            // Keep the listener open while the probe runs
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
            opened_at
        });

        let start = Instant::now();
        let probe = ReadinessProbe::new("127.0.0.1", port, &settings(100, 50));
        probe.wait_ready(&Notify::new()).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= delay, "reported ready before the listener opened");
        assert!(
            elapsed < delay + interval + Duration::from_millis(150),
            "ready reported too late: {:?}",
            elapsed
        );
        opened.abort();
    }

    #[tokio::test]
    async fn test_hint_shortcuts_interval() {
        let port = free_port().await;
        let hint = std::sync::Arc::new(Notify::new());

        let listener_hint = std::sync::Arc::clone(&hint);
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            listener_hint.notify_one();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        // With a 5s interval only the hint can make this finish quickly
        let probe = ReadinessProbe::new("127.0.0.1", port, &settings(5000, 3));
        let start = Instant::now();
        let attempts = probe.wait_ready(&hint).await.unwrap();

        assert_eq!(attempts, 2);
        assert!(start.elapsed() < Duration::from_secs(1));
        server.abort();
    }
}
