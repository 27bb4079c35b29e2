//! Hub connection doubles.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use futures::channel::mpsc;
use healwatch_web::hub::{Connection, ConnectionFuture, Frame};
use healwatch_web::{HubError, Inbound};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Connection that records every frame written to it.
///
/// # Example
///
/// ```
/// use healwatch_testing::MockConnection;
/// use healwatch_web::{BroadcastHub, HubConfig};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let hub = BroadcastHub::new(HubConfig::default());
/// let conn = Arc::new(MockConnection::new());
/// hub.register(conn.clone()).await.unwrap();
/// assert_eq!(conn.frames_of_type("connected").len(), 1);
/// hub.shutdown().await;
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MockConnection {
    frames: Mutex<Vec<String>>,
    failing: AtomicBool,
    closes: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockConnection {
    /// Healthy connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection whose writes fail from the start.
    #[must_use]
    pub fn failing() -> Self {
        let conn = Self::default();
        conn.fail_sends(true);
        conn
    }

    /// Connection whose writes take `delay` before completing.
    #[must_use]
    pub fn slow(delay: Duration) -> Self {
        let conn = Self::default();
        *conn.delay.lock().unwrap() = Some(delay);
        conn
    }

    /// Change the write delay; `None` makes writes immediate.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Toggle write failures.
    pub fn fail_sends(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Every frame successfully written, oldest first.
    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    /// Frames whose `type` field equals `kind`.
    #[must_use]
    pub fn frames_of_type(&self, kind: &str) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter(|frame| {
                serde_json::from_str::<Value>(frame)
                    .ok()
                    .and_then(|value| value.get("type").and_then(Value::as_str).map(|t| t == kind))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Frames other than the registration handshake and heartbeats.
    #[must_use]
    pub fn payload_frames(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter(|frame| {
                let kind = serde_json::from_str::<Value>(frame)
                    .ok()
                    .and_then(|value| value.get("type").and_then(Value::as_str).map(str::to_owned));
                !matches!(kind.as_deref(), Some("connected" | "ping"))
            })
            .collect()
    }

    /// How many times `close` has been called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn send(&self, frame: Frame) -> ConnectionFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(HubError::Write("injected write failure".to_string()));
            }
            self.frames.lock().unwrap().push(frame.to_string());
            Ok(())
        })
    }

    fn close(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Sending half of a scripted inbound stream.
pub type InboundSender = mpsc::UnboundedSender<Result<Inbound, HubError>>;

/// Scripted inbound stream for [`BroadcastHub::serve`](healwatch_web::BroadcastHub::serve).
///
/// Dropping the sender ends the stream, which the hub treats as a close.
#[must_use]
pub fn inbound_channel() -> (InboundSender, mpsc::UnboundedReceiver<Result<Inbound, HubError>>) {
    mpsc::unbounded()
}
