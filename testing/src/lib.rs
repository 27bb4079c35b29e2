//! # Healwatch Testing
//!
//! Testing utilities for healwatch.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: event log with failure injection
//! - [`FixedClock`] and [`test_clock`]: deterministic time
//! - [`InMemoryScanPaths`]: scan path settings without a database
//! - [`MockConnection`]: hub connection that records frames
//! - [`RecordingHandler`]: bus handler that records deliveries
//! - [`properties`]: proptest strategies for domain events
//!
//! ## Example
//!
//! ```ignore
//! use healwatch_testing::InMemoryEventLog;
//! use healwatch_core::event_bus::EventBus;
//!
//! #[tokio::test]
//! async fn detection_is_persisted() {
//!     let log = Arc::new(InMemoryEventLog::new());
//!     let bus = EventBus::new(log.clone());
//!     bus.publish(detected("abc")).await.unwrap();
//!     assert_eq!(log.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use healwatch_core::environment::Clock;

mod event_log_mocks;
mod hub_mocks;
mod recording;
mod scan_path_mocks;

pub use event_log_mocks::InMemoryEventLog;
pub use hub_mocks::{InboundSender, MockConnection, inbound_channel};
pub use recording::RecordingHandler;
pub use scan_path_mocks::InMemoryScanPaths;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use healwatch_testing::mocks::FixedClock;
    /// use healwatch_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Helpers shared by integration tests.
pub mod helpers {
    use healwatch_core::event::{DomainEvent, EventData, EventType, keys};

    /// `CorruptionDetected` for `id` with a file path and scan path.
    #[must_use]
    pub fn detected(id: &str, file_path: &str, path_id: i64) -> DomainEvent {
        DomainEvent::corruption(
            id,
            EventType::CorruptionDetected,
            EventData::new()
                .with(keys::FILE_PATH, file_path)
                .with(keys::PATH_ID, path_id),
        )
    }

    /// A corruption event with no payload.
    #[must_use]
    pub fn lifecycle(id: &str, event_type: EventType) -> DomainEvent {
        DomainEvent::corruption(id, event_type, EventData::new())
    }

    /// Install a test-friendly tracing subscriber once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use healwatch_core::event::{DomainEvent, EventData, EventType, keys};
    use proptest::prelude::*;

    /// Any corruption lifecycle event type.
    pub fn lifecycle_event_type() -> impl Strategy<Value = EventType> {
        proptest::sample::select(EventType::CORRUPTION_LIFECYCLE.to_vec())
    }

    /// A corruption event for `id` with a plausible payload.
    pub fn lifecycle_event(id: &'static str) -> impl Strategy<Value = DomainEvent> {
        (
            lifecycle_event_type(),
            any::<bool>(),
            proptest::option::of("[a-z ]{1,16}"),
        )
            .prop_map(move |(event_type, manual, error)| {
                let mut data = EventData::new();
                if event_type == EventType::RetryScheduled && manual {
                    data.insert(keys::MANUAL_RETRY, true);
                }
                if let Some(error) = error {
                    data.insert(keys::ERROR, error);
                }
                DomainEvent::corruption(id, event_type, data)
            })
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
