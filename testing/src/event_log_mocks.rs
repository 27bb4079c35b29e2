//! In-memory event log for fast, deterministic tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use healwatch_core::aggregate::AggregateId;
use healwatch_core::environment::{Clock, SystemClock};
use healwatch_core::event::DomainEvent;
use healwatch_core::event_log::{EventFilter, EventLog, EventLogError, LogFuture, sort_for_replay};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Stored {
    events: Vec<DomainEvent>,
    next_id: i64,
}

/// `Vec`-backed [`EventLog`] with failure injection.
///
/// Ids are assigned monotonically from 1. Timestamps come from the
/// configured clock, so a [`FixedClock`](crate::FixedClock) makes ordering
/// fall back to ids alone.
///
/// Clones share the same storage.
///
/// # Example
///
/// ```
/// use healwatch_testing::InMemoryEventLog;
/// use healwatch_core::event::{DomainEvent, EventData, EventType};
/// use healwatch_core::event_log::EventLog;
///
/// # tokio_test::block_on(async {
/// let log = InMemoryEventLog::new();
/// let stored = log
///     .append(DomainEvent::corruption("abc", EventType::CorruptionDetected, EventData::new()))
///     .await
///     .unwrap();
/// assert_eq!(stored.id, Some(1));
/// assert_eq!(log.len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryEventLog {
    stored: Arc<RwLock<Stored>>,
    clock: Arc<dyn Clock>,
    fail_appends: Arc<AtomicBool>,
    fail_queries: Arc<AtomicBool>,
    unavailable: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    /// Empty log stamping events with wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty log stamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            stored: Arc::new(RwLock::new(Stored {
                events: Vec::new(),
                next_id: 1,
            })),
            clock,
            fail_appends: Arc::new(AtomicBool::new(false)),
            fail_queries: Arc::new(AtomicBool::new(false)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every append fail with `Database` until reset.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail with `Database` until reset.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make `ping` report `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stored.read().unwrap().events.len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored event in replay order.
    #[must_use]
    pub fn events(&self) -> Vec<DomainEvent> {
        let mut events = self.stored.read().unwrap().events.clone();
        sort_for_replay(&mut events);
        events
    }

    /// Store events directly, bypassing failure injection.
    ///
    /// Useful for seeding history before wiring a bus.
    pub fn seed(&self, events: impl IntoIterator<Item = DomainEvent>) {
        for event in events {
            self.store(event);
        }
    }

    fn store(&self, mut event: DomainEvent) -> DomainEvent {
        let mut stored = self.stored.write().unwrap();
        event.id = Some(stored.next_id);
        stored.next_id += 1;
        if event.created_at.is_none() {
            event.created_at = Some(self.clock.now());
        }
        stored.events.push(event.clone());
        event
    }

    fn check_reads(&self) -> Result<(), EventLogError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(EventLogError::Database("injected query failure".to_string()));
        }
        Ok(())
    }
}

impl EventLog for InMemoryEventLog {
    fn append(&self, event: DomainEvent) -> LogFuture<'_, DomainEvent> {
        Box::pin(async move {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(EventLogError::Database("injected append failure".to_string()));
            }
            Ok(self.store(event))
        })
    }

    fn query<'a>(&'a self, aggregate_id: &'a AggregateId) -> LogFuture<'a, Vec<DomainEvent>> {
        Box::pin(async move {
            self.check_reads()?;
            let mut history: Vec<DomainEvent> = self
                .stored
                .read()
                .unwrap()
                .events
                .iter()
                .filter(|event| &event.aggregate_id == aggregate_id)
                .cloned()
                .collect();
            sort_for_replay(&mut history);
            Ok(history)
        })
    }

    fn query_filtered(&self, filter: EventFilter) -> LogFuture<'_, Vec<DomainEvent>> {
        Box::pin(async move {
            self.check_reads()?;
            let mut matching: Vec<DomainEvent> = self
                .stored
                .read()
                .unwrap()
                .events
                .iter()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect();
            sort_for_replay(&mut matching);
            let page = matching
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit.unwrap_or(usize::MAX))
                .collect();
            Ok(page)
        })
    }

    fn aggregate_ids<'a>(&'a self, aggregate_type: &'a str) -> LogFuture<'a, Vec<AggregateId>> {
        Box::pin(async move {
            self.check_reads()?;
            let mut ids: Vec<AggregateId> = Vec::new();
            for event in self.events() {
                if event.aggregate_type == aggregate_type && !ids.contains(&event.aggregate_id) {
                    ids.push(event.aggregate_id);
                }
            }
            Ok(ids)
        })
    }

    fn purge<'a>(&'a self, aggregate_id: &'a AggregateId) -> LogFuture<'a, u64> {
        Box::pin(async move {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(EventLogError::Database("injected delete failure".to_string()));
            }
            let mut stored = self.stored.write().unwrap();
            let before = stored.events.len();
            stored.events.retain(|event| &event.aggregate_id != aggregate_id);
            Ok((before - stored.events.len()) as u64)
        })
    }

    fn ping(&self) -> LogFuture<'_, ()> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(EventLogError::Unavailable("injected outage".to_string()));
            }
            Ok(())
        })
    }
}
