//! Event bus subscriber that records what it receives.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use healwatch_core::event::{DomainEvent, EventType};
use healwatch_core::event_bus::{EventHandler, HandlerError, HandlerFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Records every delivered event; can be told to fail.
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    events: Mutex<Vec<DomainEvent>>,
    failing: AtomicBool,
}

impl RecordingHandler {
    /// New handler, shared so it can be both subscribed and inspected.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    /// Make subsequent deliveries return an error (after recording).
    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Delivered events, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Types of delivered events, in delivery order.
    #[must_use]
    pub fn event_types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.event_type.clone())
            .collect()
    }
}

impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.events.lock().unwrap().push(event.clone());
            if self.failing.load(Ordering::SeqCst) {
                return Err(HandlerError::new(format!("{} told to fail", self.name)));
            }
            Ok(())
        })
    }
}
