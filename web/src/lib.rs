//! HTTP and real-time surface of healwatch.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Axum router                 │  ← /ws, /api/corruptions, /health
//! ├──────────────────────────────────────────┤
//! │  BroadcastHub        │  ManualActions    │
//! │  (events + logs out) │  (overrides in)   │
//! ├──────────────────────────────────────────┤
//! │        EventBus  ──►  EventLog           │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let hub = BroadcastHub::new(HubConfig::default());
//! hub.subscribe_to(&bus);
//! hub.attach_log_stream(log_layer.subscribe());
//!
//! let app = router(AppState::new(hub, log, view, actions));
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod hub;
pub mod logs;
pub mod probes;
pub mod state;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

// Re-export key types for convenience
pub use error::AppError;
pub use hub::{BroadcastHub, Connection, ConnectionId, Envelope, HubConfig, HubError, Inbound};
pub use logs::{LogBroadcastLayer, LogLine};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness))
        .route("/ws", get(handlers::websocket::handle))
        .route("/api/corruptions", get(handlers::corruptions::list_active))
        .route("/api/corruptions/:id", get(handlers::corruptions::get_corruption))
        .route("/api/corruptions/retry", post(handlers::corruptions::retry))
        .route("/api/corruptions/ignore", post(handlers::corruptions::ignore))
        .route("/api/corruptions/delete", post(handlers::corruptions::delete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
