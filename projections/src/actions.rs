//! Bulk operator actions: retry, ignore, delete.
//!
//! Each requested id is handled on its own. A malformed id, an unknown
//! aggregate, or a storage failure is counted and the batch moves on.
//!
//! Retry and ignore only apply to aggregates whose history contains a
//! `CorruptionDetected` event. Ids without one are reported as not found
//! rather than silently accepted, so a typo never shows up as a success.

use crate::state::latest_detection;
use crate::view::RemediationView;
use healwatch_core::aggregate::{AggregateId, ParseAggregateIdError};
use healwatch_core::event::{DomainEvent, EventData, EventType, keys};
use healwatch_core::event_bus::{EventBus, EventBusError};
use healwatch_core::event_log::{EventLog, EventLogError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Why a single item of a bulk action did not succeed.
#[derive(Error, Debug, Clone)]
pub enum ActionError {
    /// The id could not be parsed.
    #[error(transparent)]
    InvalidId(#[from] ParseAggregateIdError),

    /// No detection recorded for this aggregate.
    #[error("Aggregate {0} not found")]
    NotFound(AggregateId),

    /// Reading or purging the log failed.
    #[error(transparent)]
    Log(#[from] EventLogError),

    /// Publishing the override event failed.
    #[error(transparent)]
    Bus(#[from] EventBusError),
}

/// Counts reported for a bulk action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    /// Ids in the request.
    pub requested: usize,
    /// Ids the action was applied to.
    pub succeeded: usize,
    /// Ids that could not be parsed.
    pub skipped_invalid: usize,
    /// Ids with no matching aggregate.
    pub skipped_not_found: usize,
    /// Ids that hit a storage or publish failure.
    pub failed: usize,
}

impl BulkOutcome {
    fn record<T>(&mut self, result: &Result<T, ActionError>) {
        match result {
            Ok(_) => self.succeeded += 1,
            Err(ActionError::InvalidId(_)) => self.skipped_invalid += 1,
            Err(ActionError::NotFound(_)) => self.skipped_not_found += 1,
            Err(ActionError::Log(_) | ActionError::Bus(_)) => self.failed += 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Override {
    Retry,
    Ignore,
}

/// Operator overrides issued against the event log.
#[derive(Clone)]
pub struct ManualActions {
    bus: EventBus,
    log: Arc<dyn EventLog>,
    view: Option<Arc<RemediationView>>,
}

impl std::fmt::Debug for ManualActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualActions").finish_non_exhaustive()
    }
}

impl ManualActions {
    /// Create manual actions publishing through `bus`.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        let log = Arc::clone(bus.log());
        Self {
            bus,
            log,
            view: None,
        }
    }

    /// Evict purged aggregates from `view`.
    #[must_use]
    pub fn with_view(mut self, view: Arc<RemediationView>) -> Self {
        self.view = Some(view);
        self
    }

    /// Publish a manual `RetryScheduled` for every id.
    pub async fn retry(&self, ids: &[String], user_id: Option<&str>) -> BulkOutcome {
        self.bulk("retry", ids, |id| self.override_one(id, Override::Retry, user_id))
            .await
    }

    /// Publish `CorruptionIgnored` for every id.
    pub async fn ignore(&self, ids: &[String], user_id: Option<&str>) -> BulkOutcome {
        self.bulk("ignore", ids, |id| self.override_one(id, Override::Ignore, user_id))
            .await
    }

    /// Irreversibly purge the history of every id.
    pub async fn delete(&self, ids: &[String]) -> BulkOutcome {
        self.bulk("delete", ids, |id| self.delete_one(id)).await
    }

    async fn bulk<'a, F, Fut, T>(&'a self, action: &str, ids: &'a [String], run: F) -> BulkOutcome
    where
        F: Fn(&'a str) -> Fut,
        Fut: std::future::Future<Output = Result<T, ActionError>>,
    {
        let mut outcome = BulkOutcome {
            requested: ids.len(),
            ..BulkOutcome::default()
        };

        for raw in ids {
            let result = run(raw.as_str()).await;
            if let Err(e) = &result {
                warn!(action, id = %raw, error = %e, "Manual action skipped");
            }
            outcome.record(&result);
        }

        info!(
            action,
            requested = outcome.requested,
            succeeded = outcome.succeeded,
            skipped_invalid = outcome.skipped_invalid,
            skipped_not_found = outcome.skipped_not_found,
            failed = outcome.failed,
            "Manual action finished"
        );
        metrics::counter!("manual_actions.items", "action" => action.to_string())
            .increment(outcome.requested as u64);
        outcome
    }

    async fn override_one(
        &self,
        raw: &str,
        kind: Override,
        user_id: Option<&str>,
    ) -> Result<DomainEvent, ActionError> {
        let id: AggregateId = raw.parse()?;
        let history = self.log.query(&id).await?;
        let target = latest_detection(&history).ok_or_else(|| ActionError::NotFound(id.clone()))?;

        let mut data = EventData::new();
        if let Some(file_path) = target.file_path {
            data.insert(keys::FILE_PATH, file_path);
        }
        if let Some(path_id) = target.path_id {
            data.insert(keys::PATH_ID, path_id);
        }

        let event_type = match kind {
            Override::Retry => {
                data.insert(keys::MANUAL_RETRY, true);
                EventType::RetryScheduled
            }
            Override::Ignore => EventType::CorruptionIgnored,
        };

        let mut event = DomainEvent::corruption(id, event_type, data);
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        Ok(self.bus.publish(event).await?)
    }

    async fn delete_one(&self, raw: &str) -> Result<u64, ActionError> {
        let id: AggregateId = raw.parse()?;
        let removed = self.log.purge(&id).await?;
        if let Some(view) = &self.view {
            view.evict(&id);
        }
        if removed == 0 {
            return Err(ActionError::NotFound(id));
        }
        info!(aggregate_id = %id, removed, "Aggregate history purged");
        Ok(removed)
    }
}
