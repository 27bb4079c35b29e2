//! # Healwatch Core
//!
//! Event-sourcing foundation for the healwatch remediation engine.
//!
//! ## Core Concepts
//!
//! - **Domain Event**: immutable fact about one aggregate ([`event::DomainEvent`])
//! - **Event Log**: durable, append-only source of truth ([`event_log::EventLog`])
//! - **Event Bus**: in-process dispatcher that persists before it delivers
//!   ([`event_bus::EventBus`])
//! - **Projection**: read model rebuilt from the log ([`projection::Projection`])
//!
//! ## Flow
//!
//! ```text
//! producer ──► EventBus::publish ──► EventLog::append ──► handlers (in order)
//! ```
//!
//! Everything above the log is derived. If a view and a replay ever
//! disagree, the replay is right.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod event;
pub mod event_bus;
pub mod event_log;
pub mod projection;

/// Injected dependencies shared by every crate.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use healwatch_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
