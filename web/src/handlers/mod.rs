//! HTTP request handlers.

pub mod corruptions;
pub mod health;
pub mod websocket;

// Re-export common handler utilities
pub use health::health_check;
