//! Read models derived from the event log.
//!
//! A projection turns events into a denormalized view. Projections are
//! always rebuildable: dropping one and replaying the log must reproduce it
//! exactly.
//!
//! ## Two ways in
//!
//! ```text
//!   live:    EventBus ──publish──► ProjectionHandler ──► Projection::apply_event
//!   replay:  EventLog ──query────► catch_up          ──► Projection::apply_event
//! ```
//!
//! Both paths go through the same `apply_event`, so the live view and the
//! replayed view are computed by the same code.

use crate::event::{DomainEvent, EventType};
use crate::event_bus::{EventHandler, HandlerError, HandlerFuture};
use crate::event_log::{EventLog, EventLogError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// The event could not be interpreted.
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// Reading the log during catch-up failed.
    #[error("Replay failed: {0}")]
    Replay(#[from] EventLogError),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Boxed future returned by [`Projection`] methods.
pub type ProjectionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A read model kept up to date from domain events.
///
/// # Idempotency
///
/// `apply_event` may see an event again during catch-up. Implementations
/// should recompute from the log rather than increment blindly.
pub trait Projection: Send + Sync {
    /// Unique name, used in logs.
    fn name(&self) -> &str;

    /// Apply one stored event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the view could not be updated.
    fn apply_event<'a>(&'a self, event: &'a DomainEvent) -> ProjectionFuture<'a, ()>;

    /// Drop all projected data ahead of a full replay.
    ///
    /// Default implementation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the view could not be cleared.
    fn rebuild(&self) -> ProjectionFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Adapts a [`Projection`] into an [`EventHandler`] for bus subscription.
pub struct ProjectionHandler {
    projection: Arc<dyn Projection>,
}

impl ProjectionHandler {
    /// Wrap `projection`.
    #[must_use]
    pub fn new(projection: Arc<dyn Projection>) -> Arc<dyn EventHandler> {
        Arc::new(Self { projection })
    }
}

impl EventHandler for ProjectionHandler {
    fn name(&self) -> &str {
        self.projection.name()
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.projection
                .apply_event(event)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))
        })
    }
}

/// Subscribe `projection` to every type in `event_types` on `bus`.
pub fn subscribe_projection(
    bus: &crate::event_bus::EventBus,
    projection: Arc<dyn Projection>,
    event_types: &[EventType],
) {
    let handler = ProjectionHandler::new(projection);
    bus.subscribe_many(event_types, &handler);
}

/// Rebuild `projection` by replaying every aggregate of `aggregate_type`.
///
/// Returns the number of events replayed.
///
/// # Errors
///
/// - [`ProjectionError::Replay`]: the log could not be read
/// - any error from `rebuild` or `apply_event`
pub async fn catch_up(
    projection: &dyn Projection,
    log: &dyn EventLog,
    aggregate_type: &str,
) -> Result<usize> {
    info!(projection = projection.name(), aggregate_type, "Projection catch-up started");
    projection.rebuild().await?;

    let mut replayed = 0;
    for aggregate_id in log.aggregate_ids(aggregate_type).await? {
        let history = log.query(&aggregate_id).await?;
        for event in &history {
            projection.apply_event(event).await?;
        }
        replayed += history.len();
        debug!(aggregate_id = %aggregate_id, events = history.len(), "Aggregate replayed");
    }

    metrics::counter!("projection.replayed_events", "projection" => projection.name().to_string())
        .increment(replayed as u64);
    info!(projection = projection.name(), replayed, "Projection catch-up finished");
    Ok(replayed)
}
