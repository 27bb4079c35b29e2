//! Application state for Axum handlers.

use crate::hub::BroadcastHub;
use crate::probes::{DEFAULT_PROBE_TIMEOUT, EventLogProbe, Probe};
use healwatch_core::event_log::EventLog;
use healwatch_projections::{ManualActions, RemediationView};
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Observer fan-out.
    pub hub: BroadcastHub,
    /// Source of truth for aggregate history.
    pub log: Arc<dyn EventLog>,
    /// Materialized remediation state.
    pub view: Arc<RemediationView>,
    /// Operator overrides.
    pub actions: ManualActions,
    /// Readiness probes.
    pub probes: Arc<[Arc<dyn Probe>]>,
    /// Deadline for each readiness probe.
    pub probe_timeout: Duration,
}

impl AppState {
    /// State with the event log as the only readiness probe.
    #[must_use]
    pub fn new(
        hub: BroadcastHub,
        log: Arc<dyn EventLog>,
        view: Arc<RemediationView>,
        actions: ManualActions,
    ) -> Self {
        let probes: Vec<Arc<dyn Probe>> = vec![Arc::new(EventLogProbe::new(Arc::clone(&log)))];
        Self {
            hub,
            log,
            view,
            actions,
            probes: probes.into(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Add downstream probes and set the per-probe deadline.
    #[must_use]
    pub fn with_probes(mut self, extra: Vec<Arc<dyn Probe>>, timeout: Duration) -> Self {
        let mut probes: Vec<Arc<dyn Probe>> = self.probes.iter().cloned().collect();
        probes.extend(extra);
        self.probes = probes.into();
        self.probe_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_clone() {
        fn assert_clone<T: Clone + Send + Sync>() {}
        assert_clone::<AppState>();
    }
}
