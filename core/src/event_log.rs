//! Event log contract: the durable, append-only home of every domain event.
//!
//! The log is the single source of truth. The event bus appends here before
//! dispatching anything, and projections can always be rebuilt by replaying
//! an aggregate's history from it.
//!
//! # Implementations
//!
//! - `PostgresEventLog` (in `healwatch-postgres`): production implementation
//! - `InMemoryEventLog` (in `healwatch-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use healwatch_core::aggregate::AggregateId;
//! use healwatch_core::event::{DomainEvent, EventData, EventType};
//! use healwatch_core::event_log::{EventLog, EventLogError};
//!
//! async fn example(log: &dyn EventLog) -> Result<(), EventLogError> {
//!     let stored = log
//!         .append(DomainEvent::corruption("abc", EventType::CorruptionDetected, EventData::new()))
//!         .await?;
//!     assert!(stored.id.is_some());
//!
//!     let history = log.query(&AggregateId::new("abc")).await?;
//!     assert_eq!(history.len(), 1);
//!     Ok(())
//! }
//! ```

use crate::aggregate::AggregateId;
use crate::event::{DomainEvent, EventType};
use crate::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`EventLog`] methods.
pub type LogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventLogError>> + Send + 'a>>;

/// Errors that can occur during event log operations.
#[derive(Error, Debug, Clone)]
pub enum EventLogError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The log is not reachable right now.
    #[error("Event log unavailable: {0}")]
    Unavailable(String),
}

/// Filter for list-view queries over the log.
///
/// All set criteria must match. Results are ordered by `(created_at, id)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventFilter {
    /// Restrict to one aggregate type.
    pub aggregate_type: Option<String>,
    /// Restrict to these event types (empty = any).
    pub event_types: Vec<EventType>,
    /// Only events created strictly after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Maximum number of events to return.
    pub limit: Option<usize>,
    /// Number of matching events to skip.
    pub offset: usize,
}

impl EventFilter {
    /// A filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one aggregate type.
    #[must_use]
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Restrict to a single event type.
    #[must_use]
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    /// Only events created after `instant`.
    #[must_use]
    pub const fn created_after(mut self, instant: DateTime<Utc>) -> Self {
        self.created_after = Some(instant);
        self
    }

    /// Page the results.
    #[must_use]
    pub const fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// Whether `event` satisfies the non-paging criteria of this filter.
    #[must_use]
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(aggregate_type) = &self.aggregate_type {
            if &event.aggregate_type != aggregate_type {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(after) = self.created_after {
            match event.created_at {
                Some(created_at) if created_at > after => {}
                _ => return false,
            }
        }
        true
    }
}

/// Durable, append-only store of domain events.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the log is shared by every
/// producer and consumer in the process.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures instead of using `async fn` so the log can be
/// held as `Arc<dyn EventLog>` by the event bus and the manual-action handlers.
pub trait EventLog: Send + Sync {
    /// Append an event.
    ///
    /// Assigns `id` and `created_at` when they are absent and returns the
    /// stored event. When this returns `Ok`, the event is durable.
    ///
    /// # Errors
    ///
    /// - `Database`: the write failed; the event was not stored
    /// - `Serialization`: the payload could not be encoded
    fn append(&self, event: DomainEvent) -> LogFuture<'_, DomainEvent>;

    /// Full history of one aggregate, ordered by `(created_at, id)`.
    ///
    /// Unknown aggregates yield an empty vector, not an error.
    ///
    /// # Errors
    ///
    /// - `Database`: the query failed
    /// - `Serialization`: a stored payload could not be decoded
    fn query<'a>(&'a self, aggregate_id: &'a AggregateId) -> LogFuture<'a, Vec<DomainEvent>>;

    /// Events matching `filter`, ordered by `(created_at, id)`.
    ///
    /// # Errors
    ///
    /// - `Database`: the query failed
    fn query_filtered(&self, filter: EventFilter) -> LogFuture<'_, Vec<DomainEvent>>;

    /// Distinct aggregate ids recorded for `aggregate_type`.
    ///
    /// # Errors
    ///
    /// - `Database`: the query failed
    fn aggregate_ids<'a>(&'a self, aggregate_type: &'a str) -> LogFuture<'a, Vec<AggregateId>>;

    /// Irreversibly delete an aggregate's full history.
    ///
    /// Returns the number of events removed (zero for unknown aggregates).
    ///
    /// # Errors
    ///
    /// - `Database`: the delete failed; nothing was removed
    fn purge<'a>(&'a self, aggregate_id: &'a AggregateId) -> LogFuture<'a, u64>;

    /// Cheap reachability check used by health probes.
    ///
    /// # Errors
    ///
    /// - `Unavailable` or `Database`: the log cannot be reached
    fn ping(&self) -> LogFuture<'_, ()>;
}

/// Projection order of two events: creation time, then log id.
///
/// Events without a timestamp sort after stamped ones.
#[must_use]
pub fn replay_order(a: &DomainEvent, b: &DomainEvent) -> std::cmp::Ordering {
    let by_time = match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    };
    by_time.then_with(|| a.id.cmp(&b.id))
}

/// Sort events into [`replay_order`], keeping the relative order of ties.
///
/// Used by every log implementation and by replay.
pub fn sort_for_replay(events: &mut [DomainEvent]) {
    events.sort_by(replay_order);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use crate::event::EventData;
    use chrono::TimeZone;

    fn stamped(id: i64, secs: i64, event_type: EventType) -> DomainEvent {
        let mut event = DomainEvent::corruption("abc", event_type, EventData::new())
            .at(Utc.timestamp_opt(secs, 0).single().expect("valid timestamp"));
        event.id = Some(id);
        event
    }

    #[test]
    fn database_error_display() {
        let error = EventLogError::Database("connection refused".to_string());
        assert!(format!("{error}").contains("connection refused"));
    }

    #[test]
    fn filter_matches_on_type_and_time() {
        let event = stamped(1, 100, EventType::CorruptionDetected);

        assert!(EventFilter::new().matches(&event));
        assert!(EventFilter::new().aggregate_type("corruption").matches(&event));
        assert!(!EventFilter::new().aggregate_type("scan").matches(&event));
        assert!(
            EventFilter::new()
                .event_type(EventType::CorruptionDetected)
                .matches(&event)
        );
        assert!(
            !EventFilter::new()
                .event_type(EventType::RetryScheduled)
                .matches(&event)
        );
        let before = Utc.timestamp_opt(50, 0).single().expect("valid timestamp");
        let after = Utc.timestamp_opt(150, 0).single().expect("valid timestamp");
        assert!(EventFilter::new().created_after(before).matches(&event));
        assert!(!EventFilter::new().created_after(after).matches(&event));
    }

    #[test]
    fn replay_order_is_time_then_id() {
        let mut events = vec![
            stamped(3, 200, EventType::RetryScheduled),
            stamped(2, 100, EventType::RemediationQueued),
            stamped(1, 100, EventType::CorruptionDetected),
        ];
        sort_for_replay(&mut events);
        let ids: Vec<_> = events.iter().filter_map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
