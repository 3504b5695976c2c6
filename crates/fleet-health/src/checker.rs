//! Health check probe logic.
//!
//! Performs HTTP health checks against member endpoints and tracks
//! consecutive results against the configured thresholds.

use std::time::Duration;

use tracing::{debug, info, warn};

use fleet_state::{BoxFuture, HealthState};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe did not finish within its timeout.
    TimedOut,
    /// The probe could not be executed (connection error).
    Failed,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Health check parameters shared by every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    /// HTTP path to probe (e.g. "/healthz").
    pub path: String,
    pub interval: Duration,
    /// Bound on a single probe; exceeding it counts as a failure.
    pub timeout: Duration,
    /// Consecutive successes before Unknown/Unhealthy → Healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before → Unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval: Duration::from_secs(120),
            timeout: Duration::from_secs(5),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
        }
    }
}

/// Tracks consecutive probe results for a single member.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(settings: &HealthSettings) -> Self {
        Self::with_thresholds(settings.unhealthy_threshold, settings.healthy_threshold)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthState::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the (possibly new) health state.
    pub fn record(&mut self, result: ProbeResult) -> HealthState {
        if result.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;

            if self.consecutive_successes >= self.healthy_threshold
                && self.status != HealthState::Healthy
            {
                info!(
                    successes = self.consecutive_successes,
                    from = %self.status,
                    "member became healthy"
                );
                self.status = HealthState::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;

            if self.consecutive_failures >= self.unhealthy_threshold
                && self.status != HealthState::Unhealthy
            {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    from = %self.status,
                    ?result,
                    "member marked unhealthy"
                );
                self.status = HealthState::Unhealthy;
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthState {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }
}

/// Something that can check one member.
pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, address: &'a str) -> BoxFuture<'a, ProbeResult>;
}

/// Probes `http://{address}{path}` and expects a 2xx.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, address: &'a str) -> BoxFuture<'a, ProbeResult> {
        Box::pin(http_probe(address, &self.path, self.timeout))
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` for 2xx, `Unhealthy` for non-2xx, `TimedOut` when
/// the deadline passes, or `Failed` if the connection fails.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "fleet-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> HealthSettings {
        HealthSettings {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }

    #[test]
    fn tracker_starts_unknown() {
        let tracker = HealthTracker::new(&test_settings());
        assert_eq!(tracker.status(), HealthState::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_needs_k_successes_to_become_healthy() {
        let mut tracker = HealthTracker::new(&test_settings());
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthState::Unknown);
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthState::Healthy);
    }

    #[test]
    fn tracker_stays_healthy_under_threshold() {
        let mut tracker = HealthTracker::with_thresholds(3, 1);
        tracker.record(ProbeResult::Healthy);

        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.status(), HealthState::Healthy);
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn tracker_becomes_unhealthy_at_threshold() {
        let mut tracker = HealthTracker::with_thresholds(3, 1);
        tracker.record(ProbeResult::Healthy);

        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Failed);
        let status = tracker.record(ProbeResult::TimedOut);
        assert_eq!(status, HealthState::Unhealthy);
    }

    #[test]
    fn success_interrupts_failure_run() {
        let mut tracker = HealthTracker::with_thresholds(3, 1);
        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), HealthState::Healthy);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn recovery_needs_k_successes() {
        let mut tracker = HealthTracker::with_thresholds(2, 3);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), HealthState::Unhealthy);

        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.status(), HealthState::Unhealthy);
        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.status(), HealthState::Healthy);
    }

    #[test]
    fn never_healthy_member_can_become_unhealthy() {
        let mut tracker = HealthTracker::with_thresholds(2, 2);
        tracker.record(ProbeResult::TimedOut);
        assert_eq!(tracker.status(), HealthState::Unknown);
        tracker.record(ProbeResult::TimedOut);
        assert_eq!(tracker.status(), HealthState::Unhealthy);
    }

    #[test]
    fn zero_thresholds_are_raised_to_one() {
        let mut tracker = HealthTracker::with_thresholds(0, 0);
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthState::Healthy);
        assert_eq!(tracker.record(ProbeResult::Failed), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        let result = http_probe("127.0.0.1:1", "/healthz", Duration::from_millis(500)).await;
        assert!(matches!(result, ProbeResult::Failed | ProbeResult::TimedOut));
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn http_probe_against_local_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let probe = HttpProbe::new("/healthz", Duration::from_secs(2));
        assert_eq!(probe.probe(&addr).await, ProbeResult::Healthy);
    }
}
