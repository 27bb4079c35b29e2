//! End-to-end remediation flows over the in-memory event log.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use chrono::Duration;
use healwatch_core::aggregate::{AggregateId, CORRUPTION_AGGREGATE};
use healwatch_core::environment::Clock;
use healwatch_core::event::{DomainEvent, EventData, EventType, keys};
use healwatch_core::event_bus::EventBus;
use healwatch_core::event_log::EventLog;
use healwatch_core::projection::{Projection, catch_up, subscribe_projection};
use healwatch_projections::{
    BulkOutcome, ManualActions, PolicyResolver, RemediationController, RemediationView,
    ScanPathPolicy, project,
};
use healwatch_testing::helpers::{detected, lifecycle};
use healwatch_testing::properties::lifecycle_event;
use healwatch_testing::{InMemoryEventLog, InMemoryScanPaths, test_clock};
use proptest::prelude::*;
use std::sync::Arc;

const AUTO_PATH: i64 = 1;
const MANUAL_PATH: i64 = 2;

struct Harness {
    log: Arc<InMemoryEventLog>,
    bus: EventBus,
    view: Arc<RemediationView>,
    actions: ManualActions,
}

impl Harness {
    fn new() -> Self {
        let log = Arc::new(InMemoryEventLog::with_clock(Arc::new(test_clock())));
        let bus = EventBus::new(log.clone());

        let view = Arc::new(RemediationView::new());
        subscribe_projection(&bus, view.clone(), EventType::CORRUPTION_LIFECYCLE);

        let paths = InMemoryScanPaths::new()
            .with(AUTO_PATH, true, 2)
            .with(MANUAL_PATH, false, 2);
        RemediationController::attach(
            &bus,
            PolicyResolver::new(Arc::new(paths), ScanPathPolicy::default()),
        );

        let actions = ManualActions::new(bus.clone()).with_view(view.clone());
        Self {
            log,
            bus,
            view,
            actions,
        }
    }

    async fn publish(&self, event: DomainEvent) {
        self.bus.publish(event).await.unwrap();
    }

    async fn history(&self, id: &str) -> Vec<DomainEvent> {
        self.log.query(&AggregateId::new(id)).await.unwrap()
    }

    async fn types(&self, id: &str) -> Vec<EventType> {
        self.history(id)
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    async fn fail_download(&self, id: &str) {
        self.publish(DomainEvent::corruption(
            id,
            EventType::DownloadFailed,
            EventData::new().with(keys::ERROR, "stalled"),
        ))
        .await;
    }
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(ToString::to_string).collect()
}

fn count(types: &[EventType], wanted: &EventType) -> usize {
    types.iter().filter(|t| *t == wanted).count()
}

#[tokio::test]
async fn detection_on_auto_path_is_queued() {
    let h = Harness::new();
    h.publish(detected("abc", "/movies/a.mkv", AUTO_PATH)).await;

    let history = h.history("abc").await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].event_type, EventType::RemediationQueued);
    assert_eq!(history[1].event_data.file_path(), Some("/movies/a.mkv"));
    assert_eq!(history[1].event_data.path_id(), Some(AUTO_PATH));
}

#[tokio::test]
async fn retries_stop_at_the_configured_limit() {
    let h = Harness::new();
    h.publish(detected("abc", "/movies/a.mkv", AUTO_PATH)).await;

    for _ in 0..3 {
        h.fail_download("abc").await;
    }

    let types = h.types("abc").await;
    assert_eq!(types.last(), Some(&EventType::MaxRetriesReached));
    assert_eq!(count(&types, &EventType::RetryScheduled), 2);
    assert_eq!(count(&types, &EventType::RemediationQueued), 3);

    let state = project(&h.history("abc").await).unwrap();
    assert_eq!(state.retry_count, 2);
    assert_eq!(state.last_error.as_deref(), Some("stalled"));
    assert!(state.is_terminal());

    let gave_up = h.history("abc").await.pop().unwrap();
    assert_eq!(gave_up.event_data.get_i64("retryCount"), Some(2));
    assert_eq!(gave_up.event_data.get_i64("maxRetries"), Some(2));

    // further failures after giving up are ignored
    h.fail_download("abc").await;
    let after = h.types("abc").await;
    assert_eq!(after.len(), types.len() + 1);
    assert_eq!(count(&after, &EventType::RemediationQueued), 3);
}

#[tokio::test]
async fn manual_retry_overrides_a_terminal_aggregate() {
    let h = Harness::new();
    h.publish(detected("abc", "/movies/a.mkv", AUTO_PATH)).await;
    for _ in 0..3 {
        h.fail_download("abc").await;
    }
    let before = count(&h.types("abc").await, &EventType::RemediationQueued);

    let outcome = h.actions.retry(&ids(&["abc"]), Some("alice")).await;
    assert_eq!(outcome.succeeded, 1);

    let history = h.history("abc").await;
    let queued = history.last().unwrap();
    assert_eq!(queued.event_type, EventType::RemediationQueued);
    assert!(queued.event_data.manual_retry());
    assert_eq!(queued.user_id.as_deref(), Some("alice"));
    assert_eq!(count(&h.types("abc").await, &EventType::RemediationQueued), before + 1);

    let manual = &history[history.len() - 2];
    assert_eq!(manual.event_type, EventType::RetryScheduled);
    assert_eq!(manual.event_data.file_path(), Some("/movies/a.mkv"));
}

#[tokio::test]
async fn disabled_auto_remediation_waits_for_operator() {
    let h = Harness::new();
    h.publish(detected("abc", "/tv/b.mkv", MANUAL_PATH)).await;
    assert_eq!(h.types("abc").await, vec![EventType::CorruptionDetected]);

    h.actions.retry(&ids(&["abc"]), None).await;
    assert_eq!(
        h.types("abc").await,
        vec![
            EventType::CorruptionDetected,
            EventType::RetryScheduled,
            EventType::RemediationQueued,
        ]
    );
}

#[tokio::test]
async fn failure_on_manual_path_waits_for_operator() {
    let h = Harness::new();
    h.publish(detected("abc", "/tv/b.mkv", MANUAL_PATH)).await;
    h.actions.retry(&ids(&["abc"]), Some("alice")).await;
    h.fail_download("abc").await;

    let types = h.types("abc").await;
    assert_eq!(types.last(), Some(&EventType::DownloadFailed));
    assert_eq!(count(&types, &EventType::RetryScheduled), 1);

    let state = project(&h.history("abc").await).unwrap();
    assert_eq!(state.retry_count, 1);
    assert!(state.is_active());
}

#[tokio::test]
async fn backdated_failure_does_not_reopen_a_resolved_aggregate() {
    let h = Harness::new();
    h.publish(detected("abc", "/movies/a.mkv", AUTO_PATH)).await;
    h.publish(lifecycle("abc", EventType::VerificationSuccess)).await;

    let earlier = test_clock().now() - Duration::seconds(30);
    h.publish(
        DomainEvent::corruption(
            "abc",
            EventType::DownloadFailed,
            EventData::new().with(keys::ERROR, "stalled"),
        )
        .at(earlier),
    )
    .await;

    let history = h.history("abc").await;
    assert_eq!(history.first().unwrap().event_type, EventType::DownloadFailed);
    assert_eq!(count(&h.types("abc").await, &EventType::RetryScheduled), 0);

    let replayed = project(&history).unwrap();
    assert_eq!(replayed.status, EventType::VerificationSuccess);
    assert!(replayed.is_terminal());
    assert_eq!(h.view.get(&AggregateId::new("abc")), Some(replayed));
    assert!(h.view.active().is_empty());
}

#[tokio::test]
async fn unknown_path_uses_fallback_policy() {
    let h = Harness::new();
    h.publish(detected("abc", "/other/c.mkv", 99)).await;

    assert_eq!(
        h.types("abc").await,
        vec![EventType::CorruptionDetected, EventType::RemediationQueued]
    );
}

#[tokio::test]
async fn bulk_ignore_requires_a_detection() {
    let h = Harness::new();
    h.publish(detected("a", "/movies/a.mkv", MANUAL_PATH)).await;
    h.publish(lifecycle("b", EventType::DownloadProgress)).await;

    let outcome = h.actions.ignore(&ids(&["a", "b"]), Some("ops")).await;

    assert_eq!(
        outcome,
        BulkOutcome {
            requested: 2,
            succeeded: 1,
            skipped_invalid: 0,
            skipped_not_found: 1,
            failed: 0,
        }
    );
    assert_eq!(h.types("a").await.last(), Some(&EventType::CorruptionIgnored));
    assert_eq!(h.types("b").await, vec![EventType::DownloadProgress]);
    assert!(h.view.get(&AggregateId::new("a")).unwrap().is_terminal());
}

#[tokio::test]
async fn malformed_ids_are_counted_not_fatal() {
    let h = Harness::new();
    h.publish(detected("a", "/movies/a.mkv", MANUAL_PATH)).await;

    let outcome = h.actions.retry(&ids(&["", "   ", "bad\u{7}id", "a"]), None).await;

    assert_eq!(outcome.requested, 4);
    assert_eq!(outcome.skipped_invalid, 3);
    assert_eq!(outcome.succeeded, 1);
}

#[tokio::test]
async fn storage_failures_are_counted() {
    let h = Harness::new();
    h.publish(detected("a", "/movies/a.mkv", MANUAL_PATH)).await;

    h.log.fail_queries(true);
    let outcome = h.actions.ignore(&ids(&["a"]), None).await;
    h.log.fail_queries(false);

    assert_eq!(outcome.failed, 1);
    assert_eq!(h.types("a").await, vec![EventType::CorruptionDetected]);
}

#[tokio::test]
async fn delete_purges_history_and_view() {
    let h = Harness::new();
    h.publish(detected("a", "/movies/a.mkv", AUTO_PATH)).await;
    h.publish(detected("b", "/movies/b.mkv", AUTO_PATH)).await;

    let outcome = h.actions.delete(&ids(&["a"])).await;
    assert_eq!(outcome.succeeded, 1);
    assert!(h.history("a").await.is_empty());
    assert!(h.view.get(&AggregateId::new("a")).is_none());
    assert!(h.view.get(&AggregateId::new("b")).is_some());

    let again = h.actions.delete(&ids(&["a"])).await;
    assert_eq!(again.skipped_not_found, 1);
}

#[tokio::test]
async fn view_matches_replay_after_catch_up() {
    let h = Harness::new();
    h.publish(detected("a", "/movies/a.mkv", AUTO_PATH)).await;
    h.fail_download("a").await;
    h.publish(detected("b", "/tv/b.mkv", MANUAL_PATH)).await;

    let rebuilt = RemediationView::new();
    let replayed = catch_up(&rebuilt, h.log.as_ref(), CORRUPTION_AGGREGATE)
        .await
        .unwrap();
    assert_eq!(replayed, h.log.len());

    for id in ["a", "b"] {
        let aggregate_id = AggregateId::new(id);
        let from_log = project(&h.history(id).await);
        assert_eq!(h.view.get(&aggregate_id), from_log);
        assert_eq!(rebuilt.get(&aggregate_id), from_log);
    }
    assert_eq!(rebuilt.name(), h.view.name());
}

proptest! {
    #[test]
    fn live_view_equals_replay(events in proptest::collection::vec(lifecycle_event("p"), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let log = Arc::new(InMemoryEventLog::with_clock(Arc::new(test_clock())));
            let bus = EventBus::new(log.clone());
            let view = Arc::new(RemediationView::new());
            subscribe_projection(&bus, view.clone(), EventType::CORRUPTION_LIFECYCLE);

            for event in events {
                bus.publish(event).await.unwrap();
            }

            let history = log.query(&AggregateId::new("p")).await.unwrap();
            prop_assert_eq!(view.get(&AggregateId::new("p")), project(&history));
            Ok(())
        })?;
    }
}

proptest! {
    #[test]
    fn live_view_equals_replay_with_skewed_clocks(
        events in proptest::collection::vec((lifecycle_event("p"), -120i64..120), 1..24)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let log = Arc::new(InMemoryEventLog::with_clock(Arc::new(test_clock())));
            let bus = EventBus::new(log.clone());
            let view = Arc::new(RemediationView::new());
            subscribe_projection(&bus, view.clone(), EventType::CORRUPTION_LIFECYCLE);

            let base = test_clock().now();
            for (event, offset) in events {
                bus.publish(event.at(base + Duration::seconds(offset))).await.unwrap();
            }

            let history = log.query(&AggregateId::new("p")).await.unwrap();
            prop_assert_eq!(view.get(&AggregateId::new("p")), project(&history));
            Ok(())
        })?;
    }
}
