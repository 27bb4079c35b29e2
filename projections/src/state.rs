//! Corruption aggregate state as a pure fold over its event history.
//!
//! [`project`] is the only definition of "current state". The materialized
//! [`RemediationView`](crate::view::RemediationView) calls the same
//! [`CorruptionAggregate::apply`] for every live event, so replay and the
//! cached view cannot compute different answers.

use healwatch_core::aggregate::AggregateId;
use healwatch_core::event::{DomainEvent, EventType};
use healwatch_core::{DateTime, Utc};
use serde::Serialize;

/// Failure events that feed the retry decision.
pub const FAILURE_EVENTS: &[EventType] = &[
    EventType::DeletionFailed,
    EventType::SearchFailed,
    EventType::SearchExhausted,
    EventType::DownloadFailed,
    EventType::DownloadTimeout,
    EventType::VerificationFailed,
    EventType::StuckRemediation,
];

/// Whether `event_type` is a remediation failure.
#[must_use]
pub fn is_failure(event_type: &EventType) -> bool {
    FAILURE_EVENTS.contains(event_type)
}

/// Projected state of one corruption remediation lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptionAggregate {
    /// Aggregate this state belongs to.
    pub aggregate_id: AggregateId,
    /// Last lifecycle event applied.
    pub status: EventType,
    /// Number of `RetryScheduled` events seen.
    pub retry_count: u32,
    /// Most recent error message carried by any event.
    pub last_error: Option<String>,
    /// Last known path of the affected file.
    pub file_path: Option<String>,
    /// Scan path that owns the file.
    pub path_id: Option<i64>,
    /// Creation time of the first detection.
    pub detected_at: Option<DateTime<Utc>>,
    /// Creation time of the last applied event.
    pub last_updated_at: Option<DateTime<Utc>>,
    /// A manual retry was requested and has not been queued yet.
    pub manual_retry_pending: bool,
    /// Last reported download progress, cleared when a new attempt starts.
    pub download_progress: Option<f64>,
    /// Number of lifecycle events applied.
    pub event_count: usize,
}

impl CorruptionAggregate {
    /// Empty state for `aggregate_id`, before any event.
    #[must_use]
    pub const fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            status: EventType::CorruptionDetected,
            retry_count: 0,
            last_error: None,
            file_path: None,
            path_id: None,
            detected_at: None,
            last_updated_at: None,
            manual_retry_pending: false,
            download_progress: None,
            event_count: 0,
        }
    }

    /// Apply one event. Events outside the corruption lifecycle are ignored.
    pub fn apply(&mut self, event: &DomainEvent) {
        if !event.event_type.is_corruption_lifecycle() {
            return;
        }

        let data = &event.event_data;
        match &event.event_type {
            EventType::CorruptionDetected => {
                if self.detected_at.is_none() {
                    self.detected_at = event.created_at;
                }
                if let Some(path_id) = data.path_id() {
                    self.path_id = Some(path_id);
                }
            }
            EventType::RetryScheduled => {
                self.retry_count = self.retry_count.saturating_add(1);
                self.manual_retry_pending = data.manual_retry();
                self.download_progress = None;
            }
            EventType::RemediationQueued => {
                self.manual_retry_pending = false;
                self.download_progress = None;
            }
            EventType::DownloadProgress => {
                if let Some(progress) = data.progress() {
                    self.download_progress = Some(progress);
                }
            }
            _ => {}
        }

        if let Some(file_path) = data.file_path() {
            self.file_path = Some(file_path.to_string());
        }
        if let Some(error) = data.error() {
            self.last_error = Some(error.to_string());
        }

        self.status = event.event_type.clone();
        if event.created_at.is_some() {
            self.last_updated_at = event.created_at;
        }
        self.event_count += 1;
    }

    /// Whether the aggregate sits in one of the three terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the aggregate still needs attention.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Fold an aggregate's ordered history into its current state.
///
/// Returns `None` when the history holds no corruption lifecycle event.
/// The caller supplies events in replay order (see
/// [`sort_for_replay`](healwatch_core::event_log::sort_for_replay)).
#[must_use]
pub fn project(events: &[DomainEvent]) -> Option<CorruptionAggregate> {
    let first = events
        .iter()
        .find(|e| e.event_type.is_corruption_lifecycle())?;

    let mut state = CorruptionAggregate::new(first.aggregate_id.clone());
    for event in events {
        state.apply(event);
    }
    Some(state)
}

/// Where a manual action should point: taken from the latest detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectionTarget {
    /// Path of the corrupt file.
    pub file_path: Option<String>,
    /// Scan path that owns it.
    pub path_id: Option<i64>,
}

/// Resolve file path and scan path from the most recent `CorruptionDetected`.
///
/// Returns `None` when the history holds no detection at all.
#[must_use]
pub fn latest_detection(events: &[DomainEvent]) -> Option<DetectionTarget> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::CorruptionDetected)
        .map(|e| DetectionTarget {
            file_path: e.event_data.file_path().map(str::to_string),
            path_id: e.event_data.path_id(),
        })
}
