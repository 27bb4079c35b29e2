//! Materialized cache of corruption aggregate state.
//!
//! The view is subscribed to every corruption lifecycle event and updated on
//! the publisher's task, so it is current as soon as `publish` returns. It is
//! disposable: [`catch_up`](healwatch_core::projection::catch_up) rebuilds it
//! from the log at startup.
//!
//! Each aggregate keeps its history in replay order. An event that sorts
//! before one already applied is inserted in place and the aggregate is
//! re-folded, so the cached state always equals [`project`] over the log.

use crate::state::{CorruptionAggregate, project};
use healwatch_core::aggregate::AggregateId;
use healwatch_core::event::{DomainEvent, EventType};
use healwatch_core::event_log::replay_order;
use healwatch_core::projection::{Projection, ProjectionFuture};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Projection name used in logs.
pub const VIEW_NAME: &str = "remediation_view";

#[derive(Debug)]
struct Entry {
    history: Vec<DomainEvent>,
    state: CorruptionAggregate,
}

impl Entry {
    fn new(aggregate_id: AggregateId) -> Self {
        Self {
            history: Vec::new(),
            state: CorruptionAggregate::new(aggregate_id),
        }
    }

    fn record(&mut self, event: &DomainEvent) {
        let in_order = self
            .history
            .last()
            .is_none_or(|last| replay_order(last, event) != Ordering::Greater);

        if in_order {
            self.history.push(event.clone());
            self.state.apply(event);
            return;
        }

        let position = self
            .history
            .partition_point(|e| replay_order(e, event) != Ordering::Greater);
        self.history.insert(position, event.clone());
        if let Some(state) = project(&self.history) {
            self.state = state;
        }
        debug!(
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            position,
            "Out-of-order event, aggregate re-folded"
        );
    }
}

type Entries = HashMap<AggregateId, Entry>;

/// In-memory map of aggregate id to projected state.
#[derive(Debug, Default)]
pub struct RemediationView {
    aggregates: RwLock<Entries>,
}

impl RemediationView {
    /// Create an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        match self.aggregates.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        match self.aggregates.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply one event to the cached state of its aggregate.
    pub fn apply(&self, event: &DomainEvent) {
        if !event.event_type.is_corruption_lifecycle() {
            return;
        }
        self.write()
            .entry(event.aggregate_id.clone())
            .or_insert_with(|| Entry::new(event.aggregate_id.clone()))
            .record(event);
    }

    /// Cached state of one aggregate.
    #[must_use]
    pub fn get(&self, aggregate_id: &AggregateId) -> Option<CorruptionAggregate> {
        self.read().get(aggregate_id).map(|entry| entry.state.clone())
    }

    /// Aggregates not in a terminal state, oldest update first.
    #[must_use]
    pub fn active(&self) -> Vec<CorruptionAggregate> {
        let mut active: Vec<_> = self
            .read()
            .values()
            .map(|entry| &entry.state)
            .filter(|a| a.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.last_updated_at
                .cmp(&b.last_updated_at)
                .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
        });
        active
    }

    /// Aggregates whose last event is `status`.
    #[must_use]
    pub fn by_status(&self, status: &EventType) -> Vec<CorruptionAggregate> {
        let mut matching: Vec<_> = self
            .read()
            .values()
            .map(|entry| &entry.state)
            .filter(|a| &a.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.aggregate_id.cmp(&b.aggregate_id));
        matching
    }

    /// Drop an aggregate whose history was purged.
    pub fn evict(&self, aggregate_id: &AggregateId) -> bool {
        self.write().remove(aggregate_id).is_some()
    }

    /// Number of cached aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the view holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Projection for RemediationView {
    fn name(&self) -> &str {
        VIEW_NAME
    }

    fn apply_event<'a>(&'a self, event: &'a DomainEvent) -> ProjectionFuture<'a, ()> {
        self.apply(event);
        Box::pin(async { Ok(()) })
    }

    fn rebuild(&self) -> ProjectionFuture<'_, ()> {
        self.write().clear();
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use healwatch_core::event::EventData;

    fn event(id: &str, event_type: EventType) -> DomainEvent {
        DomainEvent::corruption(id, event_type, EventData::new())
    }

    #[test]
    fn active_excludes_terminal_states() {
        let view = RemediationView::new();
        view.apply(&event("a", EventType::CorruptionDetected));
        view.apply(&event("b", EventType::CorruptionDetected));
        view.apply(&event("b", EventType::CorruptionIgnored));
        view.apply(&event("c", EventType::CorruptionDetected));
        view.apply(&event("c", EventType::MaxRetriesReached));

        let active: Vec<_> = view
            .active()
            .into_iter()
            .map(|a| a.aggregate_id.into_inner())
            .collect();
        assert_eq!(active, vec!["a".to_string()]);
        assert_eq!(view.by_status(&EventType::CorruptionIgnored).len(), 1);
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn matches_replay() {
        let history = vec![
            event("a", EventType::CorruptionDetected),
            event("a", EventType::RemediationQueued),
            event("a", EventType::VerificationFailed),
            event("a", EventType::RetryScheduled),
        ];
        let view = RemediationView::new();
        for e in &history {
            view.apply(e);
        }
        assert_eq!(view.get(&AggregateId::new("a")), project(&history));
    }

    #[test]
    fn backdated_event_is_folded_in_replay_order() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let stamped = |id: i64, offset: i64, event_type: EventType| {
            let mut e = event("a", event_type).at(base + Duration::seconds(offset));
            e.id = Some(id);
            e
        };
        let detected = stamped(1, 0, EventType::CorruptionDetected);
        let resolved = stamped(2, 60, EventType::VerificationSuccess);
        let late_failure = stamped(3, 30, EventType::DownloadFailed);

        let view = RemediationView::new();
        for e in [&detected, &resolved, &late_failure] {
            view.apply(e);
        }

        let cached = view.get(&AggregateId::new("a")).unwrap();
        assert_eq!(cached.status, EventType::VerificationSuccess);
        assert!(view.active().is_empty());
        assert_eq!(
            Some(cached),
            project(&[detected, late_failure, resolved])
        );
    }

    #[tokio::test]
    async fn rebuild_and_evict_clear_state() {
        let view = RemediationView::new();
        view.apply(&event("a", EventType::CorruptionDetected));
        view.apply(&event("b", EventType::CorruptionDetected));

        assert!(view.evict(&AggregateId::new("a")));
        assert!(!view.evict(&AggregateId::new("a")));
        assert_eq!(view.len(), 1);

        view.rebuild().await.unwrap();
        assert!(view.is_empty());
    }
}
