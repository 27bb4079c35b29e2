//! Availability probes and the aggregate health judgment.
//!
//! Probes run concurrently, each under its own deadline, so one unreachable
//! instance cannot hold up the report. Critical probes (the event log) make
//! the service unhealthy when they fail; non-critical ones (downstream media
//! manager instances) only degrade it.

use futures::future::join_all;
use healwatch_core::event_log::EventLog;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Default deadline for one probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Operational, but a non-critical dependency is offline
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

/// A probe failure.
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    /// The dependency answered with an error.
    #[error("{0}")]
    Failed(String),

    /// The dependency did not answer in time.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
}

/// Boxed future returned by [`Probe::check`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProbeError>> + Send + 'a>>;

/// One reachability check.
pub trait Probe: Send + Sync {
    /// Component name shown in the report.
    fn name(&self) -> &str;

    /// Whether failure makes the whole service unhealthy.
    fn critical(&self) -> bool;

    /// Check reachability.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Failed`] when the dependency is unreachable.
    fn check(&self) -> ProbeFuture<'_>;
}

/// Result of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Whether the component answered
    pub online: bool,

    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Probes that answered
    pub online: usize,

    /// Probes that failed or timed out
    pub offline: usize,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a report from individual checks.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        let online = checks.iter().filter(|c| c.online).count();

        Self {
            status,
            online,
            offline: checks.len() - online,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Run every probe concurrently, each bounded by `timeout`.
pub async fn run_probes(probes: &[Arc<dyn Probe>], timeout: Duration) -> HealthReport {
    let checks = join_all(probes.iter().map(|probe| async move {
        let result = match tokio::time::timeout(timeout, probe.check()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::TimedOut(timeout)),
        };

        match result {
            Ok(()) => HealthCheck {
                component: probe.name().to_string(),
                status: HealthStatus::Healthy,
                online: true,
                message: None,
            },
            Err(e) => {
                warn!(component = probe.name(), error = %e, "Probe failed");
                HealthCheck {
                    component: probe.name().to_string(),
                    status: if probe.critical() {
                        HealthStatus::Unhealthy
                    } else {
                        HealthStatus::Degraded
                    },
                    online: false,
                    message: Some(e.to_string()),
                }
            }
        }
    }))
    .await;

    let report = HealthReport::new(checks);
    debug!(status = ?report.status, online = report.online, offline = report.offline, "Health probed");
    report
}

/// Critical probe: the event log answers a ping.
pub struct EventLogProbe {
    log: Arc<dyn EventLog>,
}

impl EventLogProbe {
    /// Probe `log`.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }
}

impl Probe for EventLogProbe {
    fn name(&self) -> &str {
        "event_log"
    }

    fn critical(&self) -> bool {
        true
    }

    fn check(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            self.log
                .ping()
                .await
                .map_err(|e| ProbeError::Failed(e.to_string()))
        })
    }
}

/// Non-critical probe: a downstream instance accepts TCP connections.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    name: String,
    address: String,
}

impl TcpProbe {
    /// Probe `address` (`host:port`) under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl Probe for TcpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        false
    }

    fn check(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            TcpStream::connect(&self.address)
                .await
                .map(drop)
                .map_err(|e| ProbeError::Failed(e.to_string()))
        })
    }
}
