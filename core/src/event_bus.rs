//! In-process publish/subscribe dispatcher.
//!
//! The [`EventBus`] decouples producers (detector, remediation worker, manual
//! actions) from consumers (state projector, broadcast hub, notification
//! dispatcher).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  Producer   │
//! └──────┬──────┘
//!        │ publish(event)
//!        ▼
//! ┌─────────────────┐
//! │ 1. Append to    │◄─── Source of truth; failure aborts the publish
//! │    event log    │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ 2. Call each    │◄─── Registration order, on the producer's task
//! │    handler      │
//! └────────┬────────┘
//!          │
//!     ┌────┴─────┬──────────┐
//!     ▼          ▼          ▼
//! ┌───────┐ ┌─────────┐ ┌────────┐
//! │ View  │ │   Hub   │ │ Notify │
//! └───────┘ └─────────┘ └────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Log first**: nothing is dispatched unless the append succeeded
//! - **Synchronous call-through**: `publish` returns after every handler ran,
//!   so sequential publishes for one aggregate are observed in order
//! - **Isolation**: a handler error or panic is logged and counted, never
//!   propagated to siblings or to the producer
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new(log);
//! bus.subscribe(EventType::CorruptionDetected, handler_fn("audit", |event| async move {
//!     tracing::info!(%event, "corruption detected");
//!     Ok(())
//! }));
//! bus.publish(DomainEvent::corruption("abc", EventType::CorruptionDetected, data)).await?;
//! ```

use crate::event::{DomainEvent, EventType};
use crate::event_log::{EventLog, EventLogError};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Default time `shutdown` waits for in-flight publishes to finish.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced to producers by the event bus.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// The event could not be persisted, so it was not dispatched.
    #[error("Failed to persist event: {0}")]
    Persistence(#[from] EventLogError),

    /// `publish` was called after `shutdown`.
    #[error("Event bus is shut down")]
    ShutDown,

    /// Shutdown gave up waiting for in-flight publishes.
    #[error("Shutdown timed out with {pending} publishes still in flight")]
    DrainTimeout {
        /// Publishes still running when the timeout elapsed.
        pending: usize,
    },
}

/// Failure reported by a single handler.
///
/// Never reaches the producer; the bus logs it and moves on.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<EventLogError> for HandlerError {
    fn from(error: EventLogError) -> Self {
        Self(error.to_string())
    }
}

impl From<EventBusError> for HandlerError {
    fn from(error: EventBusError) -> Self {
        Self(error.to_string())
    }
}

/// Boxed future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// A consumer of published events.
///
/// Handlers run on the producer's task. A handler that needs to do slow work
/// should hand it off (channel, spawned task) instead of blocking the producer.
pub trait EventHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Handle one stored event.
    ///
    /// # Errors
    ///
    /// Any error is logged by the bus and otherwise ignored.
    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a>;
}

/// Handler backed by a closure, see [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin((self.f)(event.clone()))
    }
}

/// Wrap a closure as an [`EventHandler`].
///
/// The closure receives its own clone of the stored event.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

type HandlerMap = HashMap<EventType, Vec<Arc<dyn EventHandler>>>;

struct Inner {
    log: Arc<dyn EventLog>,
    handlers: RwLock<HandlerMap>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    drain_timeout: Duration,
}

/// Decrements the in-flight counter when a publish finishes, however it ends.
struct InFlightGuard<'a> {
    inner: &'a Inner,
}

impl<'a> InFlightGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

/// In-process event bus.
///
/// Construct once at startup and pass clones to every producer and consumer.
/// Clones share the same subscriptions and log.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .field("in_flight", &self.inner.in_flight.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus that persists through `log`.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self::with_drain_timeout(log, DEFAULT_DRAIN_TIMEOUT)
    }

    /// Create a bus with a custom shutdown drain timeout.
    #[must_use]
    pub fn with_drain_timeout(log: Arc<dyn EventLog>, drain_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                handlers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                drain_timeout,
            }),
        }
    }

    /// The log this bus appends to.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.inner.log
    }

    /// Register `handler` for `event_type` for the life of the process.
    ///
    /// Handlers for one type run in registration order.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        debug!(event_type = %event_type, handler = handler.name(), "Handler subscribed");
        let mut handlers = match self.inner.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.entry(event_type).or_default().push(handler);
    }

    /// Register one handler for several event types.
    pub fn subscribe_many(&self, event_types: &[EventType], handler: &Arc<dyn EventHandler>) {
        for event_type in event_types {
            self.subscribe(event_type.clone(), Arc::clone(handler));
        }
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &EventType) -> usize {
        self.handlers_for(event_type).len()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// A non-owning handle, for handlers that publish follow-up events.
    #[must_use]
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Append `event` to the log, then run every handler subscribed to its type.
    ///
    /// Returns the stored event (with `id` and `created_at` assigned) once all
    /// handlers have run.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::ShutDown`]: the bus no longer accepts events
    /// - [`EventBusError::Persistence`]: the append failed; no handler ran
    pub async fn publish(&self, event: DomainEvent) -> Result<DomainEvent, EventBusError> {
        if self.is_shut_down() {
            metrics::counter!("event_bus.rejected").increment(1);
            return Err(EventBusError::ShutDown);
        }

        let _guard = InFlightGuard::enter(&self.inner);

        // shutdown may have started between the check and the increment
        if self.is_shut_down() {
            metrics::counter!("event_bus.rejected").increment(1);
            return Err(EventBusError::ShutDown);
        }

        let stored = match self.inner.log.append(event).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Event append failed, not dispatching");
                metrics::counter!("event_bus.persistence_failures").increment(1);
                return Err(EventBusError::Persistence(e));
            }
        };

        let handlers = self.handlers_for(&stored.event_type);
        debug!(
            event_type = %stored.event_type,
            aggregate_id = %stored.aggregate_id,
            handlers = handlers.len(),
            "Dispatching event"
        );

        for handler in &handlers {
            Self::dispatch(handler.as_ref(), &stored).await;
        }

        metrics::counter!("event_bus.published", "event_type" => stored.event_type.to_string())
            .increment(1);

        Ok(stored)
    }

    /// Stop accepting publishes and wait for in-flight ones to finish.
    ///
    /// Safe to call more than once; later calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DrainTimeout`] if in-flight publishes did not
    /// finish within the drain timeout.
    pub async fn shutdown(&self) -> Result<(), EventBusError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Event bus already shut down");
            return Ok(());
        }

        info!("Event bus shutting down");
        metrics::counter!("event_bus.shutdown").increment(1);

        let inner = &self.inner;
        let drained = tokio::time::timeout(inner.drain_timeout, async {
            loop {
                let notified = inner.drained.notified();
                if inner.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("Event bus drained");
                Ok(())
            }
            Err(_) => {
                let pending = inner.in_flight.load(Ordering::Acquire);
                warn!(pending, "Event bus shutdown timed out waiting for publishes");
                Err(EventBusError::DrainTimeout { pending })
            }
        }
    }

    fn handlers_for(&self, event_type: &EventType) -> Vec<Arc<dyn EventHandler>> {
        let handlers = match self.inner.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(event_type).cloned().unwrap_or_default()
    }

    async fn dispatch(handler: &dyn EventHandler, event: &DomainEvent) {
        let outcome = AssertUnwindSafe(async { handler.handle(event).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    handler = handler.name(),
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    error = %e,
                    "Event handler failed"
                );
                metrics::counter!("event_bus.handler.failures", "handler" => handler.name().to_string())
                    .increment(1);
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    handler = handler.name(),
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    panic = %message,
                    "Event handler panicked"
                );
                metrics::counter!("event_bus.handler.failures", "handler" => handler.name().to_string())
                    .increment(1);
            }
        }
    }
}

/// Non-owning handle to an [`EventBus`].
#[derive(Clone, Debug)]
pub struct WeakEventBus {
    inner: Weak<Inner>,
}

impl WeakEventBus {
    /// Upgrade to a usable bus, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}
