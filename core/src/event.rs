//! Domain events and related types.
//!
//! A [`DomainEvent`] is an immutable fact about something that happened to an
//! aggregate. Producers build events with [`DomainEvent::new`], the event log
//! assigns `id` and `created_at` on append, and from then on the event is never
//! mutated.
//!
//! # Wire shape
//!
//! ```json
//! {
//!   "id": 42,
//!   "aggregateType": "corruption",
//!   "aggregateId": "abc",
//!   "eventType": "CorruptionDetected",
//!   "eventData": { "filePath": "/media/x.mkv", "pathId": 7 },
//!   "eventVersion": 1,
//!   "createdAt": "2025-01-01T00:00:00Z",
//!   "userId": null
//! }
//! ```

use crate::aggregate::AggregateId;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Current schema version stamped on newly created events.
pub const CURRENT_EVENT_VERSION: i32 = 1;

macro_rules! event_types {
    ($($(#[$doc:meta])* $variant:ident,)+) => {
        /// Every event type the system knows about.
        ///
        /// Unknown strings coming from producers are preserved in
        /// [`EventType::Other`] so they still round-trip through the log.
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum EventType {
            $($(#[$doc])* $variant,)+
            /// An event type this build does not recognise.
            Other(String),
        }

        impl EventType {
            /// All well-known event types, in declaration order.
            pub const KNOWN: &'static [EventType] = &[$(EventType::$variant,)+];

            /// The stable string name of this event type.
            #[must_use]
            pub fn as_str(&self) -> &str {
                match self {
                    $(EventType::$variant => stringify!($variant),)+
                    EventType::Other(name) => name.as_str(),
                }
            }
        }

        impl From<String> for EventType {
            fn from(name: String) -> Self {
                match name.as_str() {
                    $(stringify!($variant) => EventType::$variant,)+
                    _ => EventType::Other(name),
                }
            }
        }
    };
}

event_types! {
    // Corruption lifecycle
    /// Detector found a corrupt file (initial state).
    CorruptionDetected,
    /// Remediation accepted for processing.
    RemediationQueued,
    /// Deleting the corrupt file has started.
    DeletionStarted,
    /// The corrupt file was deleted.
    DeletionCompleted,
    /// Deleting the corrupt file failed.
    DeletionFailed,
    /// A re-acquisition search was requested from the media manager.
    SearchStarted,
    /// The media manager accepted the search.
    SearchCompleted,
    /// The search request failed.
    SearchFailed,
    /// The media manager found no candidate releases.
    SearchExhausted,
    /// A replacement file appeared on disk.
    FileDetected,
    /// Download progress report (0..n per attempt).
    DownloadProgress,
    /// Download did not finish inside the allowed window.
    DownloadTimeout,
    /// Download failed.
    DownloadFailed,
    /// Verification of the replacement file has started.
    VerificationStarted,
    /// The replacement file is healthy (terminal).
    VerificationSuccess,
    /// The replacement file is also corrupt.
    VerificationFailed,
    /// Another remediation attempt has been scheduled.
    RetryScheduled,
    /// Retry limit exceeded (terminal until manual override).
    MaxRetriesReached,
    /// Operator chose to ignore this corruption (terminal).
    CorruptionIgnored,
    /// The file was removed from the media manager by hand.
    ManuallyRemoved,
    /// Operator ignored a pending download.
    DownloadIgnored,
    /// The media manager refused to import the replacement.
    ImportBlocked,
    /// Watchdog saw no progress inside its timeout window.
    StuckRemediation,

    // Scan lifecycle
    /// A scan of a library path started.
    ScanStarted,
    /// A scan reported progress.
    ScanProgress,
    /// A scan finished.
    ScanCompleted,
    /// A scan aborted with an error.
    ScanFailed,

    // Notification lifecycle
    /// A notification was delivered to a channel.
    NotificationSent,
    /// A notification could not be delivered.
    NotificationFailed,
}

impl EventType {
    /// Event types that belong to the corruption remediation lifecycle.
    pub const CORRUPTION_LIFECYCLE: &'static [EventType] = &[
        EventType::CorruptionDetected,
        EventType::RemediationQueued,
        EventType::DeletionStarted,
        EventType::DeletionCompleted,
        EventType::DeletionFailed,
        EventType::SearchStarted,
        EventType::SearchCompleted,
        EventType::SearchFailed,
        EventType::SearchExhausted,
        EventType::FileDetected,
        EventType::DownloadProgress,
        EventType::DownloadTimeout,
        EventType::DownloadFailed,
        EventType::VerificationStarted,
        EventType::VerificationSuccess,
        EventType::VerificationFailed,
        EventType::RetryScheduled,
        EventType::MaxRetriesReached,
        EventType::CorruptionIgnored,
        EventType::ManuallyRemoved,
        EventType::DownloadIgnored,
        EventType::ImportBlocked,
        EventType::StuckRemediation,
    ];

    /// Event types that belong to the scan lifecycle.
    pub const SCAN_LIFECYCLE: &'static [EventType] = &[
        EventType::ScanStarted,
        EventType::ScanProgress,
        EventType::ScanCompleted,
        EventType::ScanFailed,
    ];

    /// Event types that belong to the notification lifecycle.
    pub const NOTIFICATION_LIFECYCLE: &'static [EventType] =
        &[EventType::NotificationSent, EventType::NotificationFailed];

    /// Whether this type is part of the corruption remediation lifecycle.
    #[must_use]
    pub fn is_corruption_lifecycle(&self) -> bool {
        Self::CORRUPTION_LIFECYCLE.contains(self)
    }

    /// Terminal remediation states: nothing happens automatically after them.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::VerificationSuccess
                | EventType::MaxRetriesReached
                | EventType::CorruptionIgnored
        )
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known keys inside [`EventData`].
pub mod keys {
    /// Absolute path of the affected media file.
    pub const FILE_PATH: &str = "filePath";
    /// Id of the scan path (library root) that owns the file.
    pub const PATH_ID: &str = "pathId";
    /// Set on `RetryScheduled` when an operator asked for the retry.
    pub const MANUAL_RETRY: &str = "manualRetry";
    /// Human-readable failure description.
    pub const ERROR: &str = "error";
    /// Download progress percentage.
    pub const PROGRESS: &str = "progress";
    /// Corruption classification reported by the detector.
    pub const CORRUPTION_TYPE: &str = "corruptionType";
    /// Retry attempt number carried by controller-emitted events.
    pub const ATTEMPT: &str = "attempt";
}

/// Free-form structured payload of a domain event.
///
/// A thin wrapper over a JSON object with typed accessors for the keys the
/// remediation lifecycle cares about. Unknown keys are kept as-is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData(Map<String, Value>);

impl EventData {
    /// An empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw access to a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value for `key`, if present and a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer value for `key`. Numeric strings are accepted as well since
    /// some producers stringify ids.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean value for `key`.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// `filePath` of the affected media file.
    #[must_use]
    pub fn file_path(&self) -> Option<&str> {
        self.get_str(keys::FILE_PATH).filter(|p| !p.is_empty())
    }

    /// `pathId` of the owning scan path.
    #[must_use]
    pub fn path_id(&self) -> Option<i64> {
        self.get_i64(keys::PATH_ID)
    }

    /// Whether this payload marks an operator-initiated retry.
    #[must_use]
    pub fn manual_retry(&self) -> bool {
        self.get_bool(keys::MANUAL_RETRY).unwrap_or(false)
    }

    /// Failure description, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.get_str(keys::ERROR)
    }

    /// Download progress percentage, if any.
    #[must_use]
    pub fn progress(&self) -> Option<f64> {
        self.0.get(keys::PROGRESS).and_then(Value::as_f64)
    }

    /// Number of entries in the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The underlying JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for EventData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// An immutable record of something that happened to an aggregate.
///
/// `id` and `created_at` are `None` until the event log assigns them on
/// append. Ordering within one aggregate follows `(created_at, id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Log-assigned identifier (monotonic per log).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Kind of aggregate, e.g. `"corruption"`.
    pub aggregate_type: String,

    /// Aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// What happened.
    pub event_type: EventType,

    /// Structured payload.
    #[serde(default)]
    pub event_data: EventData,

    /// Payload schema version.
    #[serde(default = "default_event_version")]
    pub event_version: i32,

    /// Creation timestamp (assigned by the log when absent).
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    /// Operator who triggered the event, for manual actions.
    #[serde(default)]
    pub user_id: Option<String>,
}

const fn default_event_version() -> i32 {
    CURRENT_EVENT_VERSION
}

impl DomainEvent {
    /// Create an event that has not been appended yet.
    ///
    /// # Examples
    ///
    /// ```
    /// use healwatch_core::event::{DomainEvent, EventData, EventType, keys};
    ///
    /// let event = DomainEvent::new(
    ///     "corruption",
    ///     "abc",
    ///     EventType::CorruptionDetected,
    ///     EventData::new()
    ///         .with(keys::FILE_PATH, "/media/x.mkv")
    ///         .with(keys::PATH_ID, 7),
    /// );
    /// assert!(event.id.is_none());
    /// assert_eq!(event.event_data.path_id(), Some(7));
    /// ```
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<AggregateId>,
        event_type: EventType,
        event_data: EventData,
    ) -> Self {
        Self {
            id: None,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type,
            event_data,
            event_version: CURRENT_EVENT_VERSION,
            created_at: None,
            user_id: None,
        }
    }

    /// Shorthand for an event on a corruption aggregate.
    #[must_use]
    pub fn corruption(
        aggregate_id: impl Into<AggregateId>,
        event_type: EventType,
        event_data: EventData,
    ) -> Self {
        Self::new(
            crate::aggregate::CORRUPTION_AGGREGATE,
            aggregate_id,
            event_type,
            event_data,
        )
    }

    /// Attach the operator who triggered this event.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Override the creation timestamp (replay fixtures, imports).
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Whether the log has already assigned identity to this event.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        self.id.is_some() && self.created_at.is_some()
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DomainEvent {{ type: {}, aggregate: {}/{}, id: {} }}",
            self.event_type,
            self.aggregate_type,
            self.aggregate_id,
            self.id.map_or_else(|| "unassigned".to_string(), |id| id.to_string())
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_strings() {
        for known in EventType::KNOWN {
            let name = known.as_str().to_string();
            assert_eq!(&EventType::from(name), known);
        }
        assert_eq!(
            EventType::from("SomethingNew".to_string()),
            EventType::Other("SomethingNew".to_string())
        );
    }

    #[test]
    fn only_three_states_are_terminal() {
        let terminal: Vec<_> = EventType::KNOWN.iter().filter(|t| t.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                &EventType::VerificationSuccess,
                &EventType::MaxRetriesReached,
                &EventType::CorruptionIgnored,
            ]
        );
    }

    #[test]
    fn wire_shape_uses_camel_case() {
        let event = DomainEvent::corruption(
            "abc",
            EventType::CorruptionDetected,
            EventData::new().with(keys::FILE_PATH, "/media/x.mkv").with(keys::PATH_ID, 7),
        )
        .with_user("admin");

        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["aggregateType"], "corruption");
        assert_eq!(json["aggregateId"], "abc");
        assert_eq!(json["eventType"], "CorruptionDetected");
        assert_eq!(json["eventData"]["pathId"], 7);
        assert_eq!(json["userId"], "admin");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn wire_shape_accepts_minimal_payload() {
        let json = r#"{
            "aggregateType": "corruption",
            "aggregateId": "abc",
            "eventType": "RetryScheduled",
            "eventData": { "manualRetry": true }
        }"#;
        let event: DomainEvent = serde_json::from_str(json).expect("deserialize event");
        assert_eq!(event.event_type, EventType::RetryScheduled);
        assert!(event.event_data.manual_retry());
        assert_eq!(event.event_version, CURRENT_EVENT_VERSION);
        assert!(event.created_at.is_none());
    }

    #[test]
    fn path_id_accepts_numeric_strings() {
        let data = EventData::new().with(keys::PATH_ID, "12");
        assert_eq!(data.path_id(), Some(12));
        let data = EventData::new().with(keys::PATH_ID, "twelve");
        assert_eq!(data.path_id(), None);
    }

    #[test]
    fn empty_file_path_is_treated_as_missing() {
        let data = EventData::new().with(keys::FILE_PATH, "");
        assert_eq!(data.file_path(), None);
    }
}
