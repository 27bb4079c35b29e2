//! Bounded-retry control loop.
//!
//! The controller listens for detections, failures, and scheduled retries and
//! publishes the next automatic step. Every decision is taken against the
//! aggregate's replayed history, never a cached counter. An event that sorts
//! before a later lifecycle event in replay order triggers nothing.
//!
//! ```text
//! CorruptionDetected ──auto?──► RemediationQueued
//! <failure>          ──auto, count < max──► RetryScheduled ──► RemediationQueued
//!                    └─otherwise────► MaxRetriesReached (terminal)
//! RetryScheduled{manualRetry} ──────► RemediationQueued (override)
//! ```

use crate::policy::{PolicyResolver, ScanPathPolicy};
use crate::state::{CorruptionAggregate, FAILURE_EVENTS, is_failure, latest_detection, project};
use healwatch_core::event::{DomainEvent, EventData, EventType, keys};
use healwatch_core::event_bus::{EventBus, EventHandler, HandlerError, HandlerFuture, WeakEventBus};
use healwatch_core::event_log::EventLog;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the controller does after an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Publish `RemediationQueued`.
    Queue {
        /// Triggered by an operator override.
        manual: bool,
    },
    /// Publish `RetryScheduled`.
    Retry,
    /// Publish `MaxRetriesReached`.
    GiveUp,
    /// Auto-remediation is disabled; wait for an operator.
    AwaitOperator,
    /// Nothing to do.
    Nothing,
}

/// Pick the next automatic step.
///
/// `retry_count` includes the event being handled. `was_terminal` describes
/// the aggregate before the event.
#[must_use]
pub fn decide(
    event_type: &EventType,
    manual_retry: bool,
    was_terminal: bool,
    retry_count: u32,
    policy: &ScanPathPolicy,
) -> Decision {
    let manual_override = *event_type == EventType::RetryScheduled && manual_retry;
    if was_terminal && !manual_override {
        return Decision::Nothing;
    }

    match event_type {
        EventType::CorruptionDetected if policy.auto_remediate => Decision::Queue { manual: false },
        EventType::CorruptionDetected => Decision::AwaitOperator,
        EventType::RetryScheduled if manual_retry => Decision::Queue { manual: true },
        EventType::RetryScheduled if !policy.auto_remediate => Decision::AwaitOperator,
        EventType::RetryScheduled if retry_count <= policy.max_retries => {
            Decision::Queue { manual: false }
        }
        EventType::RetryScheduled => Decision::GiveUp,
        failure if is_failure(failure) && !policy.auto_remediate => Decision::AwaitOperator,
        failure if is_failure(failure) && retry_count < policy.max_retries => Decision::Retry,
        failure if is_failure(failure) => Decision::GiveUp,
        _ => Decision::Nothing,
    }
}

/// Event types the controller reacts to.
#[must_use]
pub fn watched_events() -> Vec<EventType> {
    let mut watched = vec![EventType::CorruptionDetected, EventType::RetryScheduled];
    watched.extend_from_slice(FAILURE_EVENTS);
    watched
}

/// Bus handler that drives automatic remediation.
pub struct RemediationController {
    bus: WeakEventBus,
    log: Arc<dyn EventLog>,
    policies: PolicyResolver,
}

impl RemediationController {
    /// Create a controller and subscribe it to `bus`.
    pub fn attach(bus: &EventBus, policies: PolicyResolver) -> Arc<Self> {
        let controller = Arc::new(Self {
            bus: bus.downgrade(),
            log: Arc::clone(bus.log()),
            policies,
        });
        let handler: Arc<dyn EventHandler> = controller.clone();
        bus.subscribe_many(&watched_events(), &handler);
        controller
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let history = self.log.query(&event.aggregate_id).await?;

        // act only on the newest lifecycle event; anything older was already
        // overtaken by what followed it in replay order
        let position = event
            .id
            .and_then(|id| history.iter().position(|e| e.id == Some(id)));
        if let Some(position) = position {
            let superseded = history[position + 1..]
                .iter()
                .any(|e| e.event_type.is_corruption_lifecycle());
            if superseded {
                debug!(
                    aggregate_id = %event.aggregate_id,
                    event_type = %event.event_type,
                    "Event superseded in replay order, no transition"
                );
                return Ok(());
            }
        }

        let Some(current) = project(&history) else {
            return Ok(());
        };
        let preceding = position.map_or(&history[..], |position| &history[..position]);
        let was_terminal = project(preceding)
            .as_ref()
            .is_some_and(CorruptionAggregate::is_terminal);

        let target = latest_detection(&history);
        let path_id = target.as_ref().and_then(|t| t.path_id).or(current.path_id);
        let policy = self.policies.resolve(path_id).await;

        let decision = decide(
            &event.event_type,
            event.event_data.manual_retry(),
            was_terminal,
            current.retry_count,
            &policy,
        );

        let mut data = EventData::new();
        if let Some(file_path) = target.and_then(|t| t.file_path).or(current.file_path.clone()) {
            data.insert(keys::FILE_PATH, file_path);
        }
        if let Some(path_id) = path_id {
            data.insert(keys::PATH_ID, path_id);
        }

        let next = match decision {
            Decision::Queue { manual } => {
                if manual {
                    data.insert(keys::MANUAL_RETRY, true);
                }
                EventType::RemediationQueued
            }
            Decision::Retry => {
                data.insert(keys::ATTEMPT, current.retry_count + 1);
                if let Some(error) = &current.last_error {
                    data.insert(keys::ERROR, error.clone());
                }
                EventType::RetryScheduled
            }
            Decision::GiveUp => {
                data.insert("retryCount", current.retry_count);
                data.insert("maxRetries", policy.max_retries);
                if let Some(error) = &current.last_error {
                    data.insert(keys::ERROR, error.clone());
                }
                EventType::MaxRetriesReached
            }
            Decision::AwaitOperator => {
                debug!(
                    aggregate_id = %event.aggregate_id,
                    path_id,
                    "Auto-remediation disabled, awaiting operator"
                );
                return Ok(());
            }
            Decision::Nothing => return Ok(()),
        };

        let Some(bus) = self.bus.upgrade() else {
            warn!(aggregate_id = %event.aggregate_id, "Event bus dropped, transition skipped");
            return Ok(());
        };

        info!(
            aggregate_id = %event.aggregate_id,
            from = %event.event_type,
            to = %next,
            retry_count = current.retry_count,
            max_retries = policy.max_retries,
            "Remediation transition"
        );
        metrics::counter!("remediation.transitions", "to" => next.to_string()).increment(1);

        let mut follow_up = DomainEvent::corruption(event.aggregate_id.clone(), next, data);
        if let Some(user_id) = &event.user_id {
            follow_up = follow_up.with_user(user_id.clone());
        }
        bus.publish(follow_up).await?;
        Ok(())
    }
}

impl EventHandler for RemediationController {
    fn name(&self) -> &str {
        "remediation_controller"
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(self.on_event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTO: ScanPathPolicy = ScanPathPolicy {
        path_id: Some(1),
        auto_remediate: true,
        max_retries: 2,
    };

    const MANUAL: ScanPathPolicy = ScanPathPolicy {
        path_id: Some(2),
        auto_remediate: false,
        max_retries: 2,
    };

    #[test]
    fn detection_queues_only_when_auto() {
        assert_eq!(
            decide(&EventType::CorruptionDetected, false, false, 0, &AUTO),
            Decision::Queue { manual: false }
        );
        assert_eq!(
            decide(&EventType::CorruptionDetected, false, false, 0, &MANUAL),
            Decision::AwaitOperator
        );
    }

    #[test]
    fn failures_retry_until_limit() {
        for failure in FAILURE_EVENTS {
            assert_eq!(decide(failure, false, false, 0, &AUTO), Decision::Retry);
            assert_eq!(decide(failure, false, false, 1, &AUTO), Decision::Retry);
            assert_eq!(decide(failure, false, false, 2, &AUTO), Decision::GiveUp);
        }
    }

    #[test]
    fn automatic_retry_respects_limit() {
        assert_eq!(
            decide(&EventType::RetryScheduled, false, false, 2, &AUTO),
            Decision::Queue { manual: false }
        );
        assert_eq!(
            decide(&EventType::RetryScheduled, false, false, 3, &AUTO),
            Decision::GiveUp
        );
        assert_eq!(
            decide(&EventType::RetryScheduled, false, false, 1, &MANUAL),
            Decision::AwaitOperator
        );
    }

    #[test]
    fn failures_on_manual_paths_wait_for_operator() {
        for failure in FAILURE_EVENTS {
            assert_eq!(decide(failure, false, false, 0, &MANUAL), Decision::AwaitOperator);
            assert_eq!(decide(failure, false, false, 5, &MANUAL), Decision::AwaitOperator);
        }
    }

    #[test]
    fn manual_retry_overrides_everything() {
        assert_eq!(
            decide(&EventType::RetryScheduled, true, true, 9, &MANUAL),
            Decision::Queue { manual: true }
        );
    }

    #[test]
    fn terminal_aggregates_stay_put() {
        assert_eq!(
            decide(&EventType::DownloadFailed, false, true, 0, &AUTO),
            Decision::Nothing
        );
        assert_eq!(
            decide(&EventType::CorruptionDetected, false, true, 0, &AUTO),
            Decision::Nothing
        );
        assert_eq!(
            decide(&EventType::DownloadProgress, false, false, 0, &AUTO),
            Decision::Nothing
        );
    }
}
