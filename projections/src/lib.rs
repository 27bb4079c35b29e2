//! Remediation state for healwatch.
//!
//! # Overview
//!
//! - [`state`]: the pure fold from an aggregate's history to its current state
//! - [`view`]: the materialized cache of that fold, kept current by the bus
//! - [`policy`]: per-scan-path auto-remediation and retry settings
//! - [`controller`]: the bounded-retry control loop
//! - [`actions`]: bulk operator overrides (retry, ignore, delete)
//!
//! # Wiring
//!
//! ```ignore
//! use healwatch_core::projection::subscribe_projection;
//! use healwatch_core::event::EventType;
//!
//! let view = Arc::new(RemediationView::new());
//! subscribe_projection(&bus, view.clone(), EventType::CORRUPTION_LIFECYCLE);
//! RemediationController::attach(&bus, PolicyResolver::new(scan_paths, ScanPathPolicy::default()));
//! let actions = ManualActions::new(bus.clone()).with_view(view.clone());
//! ```

pub mod actions;
pub mod controller;
pub mod policy;
pub mod state;
pub mod view;

// Re-export main types for convenience
pub use actions::{ActionError, BulkOutcome, ManualActions};
pub use controller::{Decision, RemediationController};
pub use policy::{PolicyResolver, ScanPathError, ScanPathPolicy, ScanPathSource};
pub use state::{CorruptionAggregate, project};
pub use view::RemediationView;
