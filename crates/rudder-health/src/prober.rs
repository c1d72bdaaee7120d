//! Probe logic — a single HTTP GET per probe, and a per-instance
//! consecutive-failure tracker.

use std::time::Duration;

use tracing::{debug, warn};

use rudder_state::{ProbeOutcome, ProbeSettings, Readiness};

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct ProbeTracker {
    readiness: Readiness,
    consecutive_failures: u32,
    /// Failures before the instance is reclassified as Failed.
    failure_threshold: u32,
    /// Set once the threshold is crossed; stays set (a Failed instance
    /// is replaced, not resurrected).
    failed: bool,
}

impl ProbeTracker {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self::with_threshold(settings.failure_threshold)
    }

    pub fn with_threshold(failure_threshold: u32) -> Self {
        Self {
            readiness: Readiness::Unknown,
            consecutive_failures: 0,
            failure_threshold,
            failed: false,
        }
    }

    /// Record a probe outcome and return the new readiness.
    ///
    /// A single success recovers readiness and resets the failure streak;
    /// crossing the failure threshold marks the instance as failed.
    pub fn record(&mut self, outcome: ProbeOutcome) -> Readiness {
        match outcome {
            ProbeOutcome::Success => {
                if !self.failed {
                    if self.readiness != Readiness::Ready && self.consecutive_failures > 0 {
                        debug!(
                            failures = self.consecutive_failures,
                            "instance recovered before failure threshold"
                        );
                    }
                    self.readiness = Readiness::Ready;
                }
                self.consecutive_failures = 0;
            }
            ProbeOutcome::Failure => {
                self.consecutive_failures += 1;
                self.readiness = Readiness::NotReady;
                if self.consecutive_failures >= self.failure_threshold && !self.failed {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.failure_threshold,
                        "failure threshold crossed, instance marked failed"
                    );
                    self.failed = true;
                }
            }
        }
        self.readiness
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the instance has crossed the failure threshold and needs
    /// replacement.
    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

/// Perform one HTTP health probe against an endpoint.
///
/// Returns `Success` for a 2xx response; a non-2xx response, a connection
/// error, or a timeout all count as `Failure`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeOutcome {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return ProbeOutcome::Failure;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeOutcome::Failure;
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
            .header("user-agent", "rudder-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "probe request build failed");
                return ProbeOutcome::Failure;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Success,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "probe non-2xx");
                ProbeOutcome::Failure
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeOutcome::Failure
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "probe timed out");
            ProbeOutcome::Failure
        }
    }
}
