//! Broadcast hub: fans domain events and log lines out to live observers.
//!
//! # Architecture
//!
//! ```text
//!   EventBus handler ─┐
//!   log stream task ──┼──► mpsc (bounded) ──► Coordinator ──► members (HashMap)
//!   register/unreg ───┘                          │
//!                                                ├── concurrent writes, per-write timeout
//!                                                └── failed writes ⇒ evict + close
//!
//!   per connection:  read loop ─┐
//!                    heartbeat ─┴── child CancellationToken of the hub token
//! ```
//!
//! Only the coordinator task mutates the membership map. The mutex around it
//! exists so `live_count` and broadcast snapshots can read it from anywhere.
//! The command channel is bounded, so a stalled coordinator slows producers
//! down instead of queueing without limit.

use crate::logs::LogLine;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{Stream, StreamExt};
use healwatch_core::event::{DomainEvent, EventType};
use healwatch_core::event_bus::{EventBus, EventHandler, HandlerError, HandlerFuture};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A serialized envelope, shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

/// Errors raised by the hub and its connections.
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// The hub no longer services requests.
    #[error("Broadcast hub is shut down")]
    ShutDown,

    /// Writing to a connection failed.
    #[error("Write failed: {0}")]
    Write(String),

    /// Writing to a connection did not finish in time.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Reading from a connection failed.
    #[error("Read failed: {0}")]
    Read(String),

    /// An envelope could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Handle of one registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Boxed future returned by [`Connection`] methods.
pub type ConnectionFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound side of one observer's transport.
///
/// Implementations must tolerate `send` and `close` being called from
/// different tasks.
pub trait Connection: Send + Sync {
    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Write`] if the transport rejected the frame.
    fn send(&self, frame: Frame) -> ConnectionFuture<'_, Result<(), HubError>>;

    /// Close the transport. Errors are swallowed; the peer may already be gone.
    fn close(&self) -> ConnectionFuture<'_, ()>;
}

/// Something received from an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Any frame; counts as an acknowledgment and extends the read deadline.
    Message,
    /// The peer closed the connection.
    Close,
}

/// `{type, data}` message delivered to observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    /// Discriminator: `"event"`, `"log"`, `"ping"`, `"connected"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload.
    pub data: Value,
}

impl Envelope {
    /// Build an envelope with any discriminator.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    /// Wrap a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Serialization`] if the event cannot be encoded.
    pub fn event(event: &DomainEvent) -> Result<Self, HubError> {
        let data = serde_json::to_value(event).map_err(|e| HubError::Serialization(e.to_string()))?;
        Ok(Self::new("event", data))
    }

    /// Wrap a captured log line.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Serialization`] if the line cannot be encoded.
    pub fn log(line: &LogLine) -> Result<Self, HubError> {
        let data = serde_json::to_value(line).map_err(|e| HubError::Serialization(e.to_string()))?;
        Ok(Self::new("log", data))
    }

    /// Heartbeat carrying the send time.
    #[must_use]
    pub fn ping(at: DateTime<Utc>) -> Self {
        Self::new("ping", at.to_rfc3339())
    }

    /// Handshake sent right after registration.
    #[must_use]
    pub fn connected(id: ConnectionId, at: DateTime<Utc>) -> Self {
        Self::new(
            "connected",
            json!({ "connectionId": id.get(), "timestamp": at.to_rfc3339() }),
        )
    }

    /// Encode once for delivery to every member.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Serialization`] if encoding fails.
    pub fn to_frame(&self) -> Result<Frame, HubError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| HubError::Serialization(e.to_string()))
    }
}

/// Hub tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Silence allowed from a connection before it is dropped.
    pub read_timeout: Duration,
    /// Time allowed for one frame write.
    pub write_timeout: Duration,
    /// Capacity of the coordinator's command channel.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            command_capacity: 64,
        }
    }
}

impl HubConfig {
    /// Heartbeat period: 90% of the read timeout.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.read_timeout.mul_f64(0.9)
    }
}

/// Result of one confirmed broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members that accepted the frame.
    pub delivered: usize,
    /// Members removed because the write failed.
    pub evicted: usize,
}

/// Every event type forwarded to observers.
#[must_use]
pub fn broadcast_allow_list() -> Vec<EventType> {
    EventType::SCAN_LIFECYCLE
        .iter()
        .chain(EventType::CORRUPTION_LIFECYCLE)
        .chain(EventType::NOTIFICATION_LIFECYCLE)
        .cloned()
        .collect()
}

#[derive(Clone)]
struct Member {
    conn: Arc<dyn Connection>,
    token: CancellationToken,
}

type Members = Arc<Mutex<HashMap<ConnectionId, Member>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum Command {
    Register {
        id: ConnectionId,
        member: Member,
        hello: Frame,
        ack: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        id: ConnectionId,
        ack: oneshot::Sender<bool>,
    },
    Broadcast {
        frame: Frame,
        done: Option<oneshot::Sender<BroadcastReport>>,
    },
}

/// Single writer of the membership map.
struct Coordinator {
    commands: mpsc::Receiver<Command>,
    members: Members,
    token: CancellationToken,
    write_timeout: Duration,
}

impl Coordinator {
    async fn run(mut self) {
        debug!("Hub coordinator started");
        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        self.teardown().await;
    }

    async fn handle(&self, command: Command) {
        match command {
            Command::Register {
                id,
                member,
                hello,
                ack,
            } => {
                let conn = Arc::clone(&member.conn);
                let count = {
                    let mut members = lock(&self.members);
                    members.insert(id, member);
                    members.len()
                };
                metrics::gauge!("hub.connections").set(count as f64);

                let result = match tokio::time::timeout(self.write_timeout, conn.send(hello)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(HubError::WriteTimeout(self.write_timeout)),
                };
                if let Err(e) = &result {
                    warn!(connection_id = %id, error = %e, "Handshake failed");
                    self.remove(id).await;
                } else {
                    debug!(connection_id = %id, live = count, "Connection registered");
                }
                let _ = ack.send(result);
            }
            Command::Unregister { id, ack } => {
                let removed = self.remove(id).await;
                let _ = ack.send(removed);
            }
            Command::Broadcast { frame, done } => {
                let report = self.fan_out(frame).await;
                if let Some(done) = done {
                    let _ = done.send(report);
                }
            }
        }
    }

    /// Remove and close a member. Returns `false` if it was already gone.
    async fn remove(&self, id: ConnectionId) -> bool {
        let (member, count) = {
            let mut members = lock(&self.members);
            let member = members.remove(&id);
            (member, members.len())
        };
        let Some(member) = member else {
            return false;
        };

        member.token.cancel();
        let _ = tokio::time::timeout(self.write_timeout, member.conn.close()).await;
        metrics::gauge!("hub.connections").set(count as f64);
        debug!(connection_id = %id, live = count, "Connection unregistered");
        true
    }

    async fn fan_out(&self, frame: Frame) -> BroadcastReport {
        let snapshot: Vec<(ConnectionId, Arc<dyn Connection>)> = lock(&self.members)
            .iter()
            .map(|(id, member)| (*id, Arc::clone(&member.conn)))
            .collect();

        let write_timeout = self.write_timeout;
        let writes = snapshot.iter().map(|(id, conn)| {
            let frame = Arc::clone(&frame);
            async move {
                let result = match tokio::time::timeout(write_timeout, conn.send(frame)).await {
                    Ok(result) => result,
                    Err(_) => Err(HubError::WriteTimeout(write_timeout)),
                };
                (*id, result)
            }
        });

        let mut report = BroadcastReport::default();
        for (id, result) in join_all(writes).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Broadcast write failed, evicting connection");
                    if self.remove(id).await {
                        report.evicted += 1;
                    }
                }
            }
        }

        if report.evicted > 0 {
            metrics::counter!("hub.broadcast.evicted").increment(report.evicted as u64);
        }
        report
    }

    async fn teardown(&mut self) {
        self.commands.close();

        // registrations that raced with shutdown are closed too
        let mut closing: Vec<Member> = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Register { member, .. } = command {
                closing.push(member);
            }
        }
        closing.extend(lock(&self.members).drain().map(|(_, member)| member));

        let write_timeout = self.write_timeout;
        join_all(closing.iter().map(|member| async move {
            member.token.cancel();
            let _ = tokio::time::timeout(write_timeout, member.conn.close()).await;
        }))
        .await;

        metrics::gauge!("hub.connections").set(0.0);
        info!(closed = closing.len(), "Hub coordinator stopped");
    }
}

struct HubInner {
    config: HubConfig,
    commands: mpsc::Sender<Command>,
    members: Members,
    next_id: AtomicU64,
    token: CancellationToken,
    shut_down: AtomicBool,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    tasks: TaskTracker,
}

/// Concurrent broadcast hub.
///
/// Cheap to clone; clones share one coordinator.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("config", &self.inner.config)
            .field("live", &self.live_count())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl BroadcastHub {
    /// Start a hub and its coordinator task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let (commands, receiver) = mpsc::channel(config.command_capacity.max(1));
        let members: Members = Arc::new(Mutex::new(HashMap::new()));
        let token = CancellationToken::new();

        let coordinator = Coordinator {
            commands: receiver,
            members: Arc::clone(&members),
            token: token.clone(),
            write_timeout: config.write_timeout,
        };
        let handle = tokio::spawn(coordinator.run());

        Self {
            inner: Arc::new(HubInner {
                config,
                commands,
                members,
                next_id: AtomicU64::new(1),
                token,
                shut_down: AtomicBool::new(false),
                coordinator: Mutex::new(Some(handle)),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Hub tuning in effect.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Number of registered connections.
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.inner.members).len()
    }

    /// Number of hub tasks still running: per-connection read loops and
    /// heartbeats, plus the log forwarder.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    async fn submit(&self, command: Command) -> Result<(), HubError> {
        if self.inner.token.is_cancelled() {
            return Err(HubError::ShutDown);
        }
        tokio::select! {
            () = self.inner.token.cancelled() => Err(HubError::ShutDown),
            sent = self.inner.commands.send(command) => sent.map_err(|_| HubError::ShutDown),
        }
    }

    async fn register_member(
        &self,
        conn: Arc<dyn Connection>,
    ) -> Result<(ConnectionId, CancellationToken), HubError> {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.inner.token.child_token();
        let hello = Envelope::connected(id, Utc::now()).to_frame()?;
        let (ack, acked) = oneshot::channel();

        let command = Command::Register {
            id,
            member: Member {
                conn: Arc::clone(&conn),
                token: token.clone(),
            },
            hello,
            ack,
        };
        if let Err(e) = self.submit(command).await {
            conn.close().await;
            return Err(e);
        }

        // a dropped ack means teardown already closed the connection
        acked.await.map_err(|_| HubError::ShutDown)??;
        Ok((id, token))
    }

    /// Add a connection to the live set and send it the handshake.
    ///
    /// On error the connection has been closed.
    ///
    /// # Errors
    ///
    /// - [`HubError::ShutDown`]: the hub no longer accepts members
    /// - [`HubError::Write`] or [`HubError::WriteTimeout`]: the handshake failed
    pub async fn register(&self, conn: Arc<dyn Connection>) -> Result<ConnectionId, HubError> {
        self.register_member(conn).await.map(|(id, _)| id)
    }

    /// Remove and close a connection.
    ///
    /// Returns `true` if this call removed it. Repeated calls, and calls
    /// after shutdown, are no-ops returning `false`.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let (ack, acked) = oneshot::channel();
        if self.submit(Command::Unregister { id, ack }).await.is_err() {
            return false;
        }
        acked.await.unwrap_or(false)
    }

    /// Hand an envelope to the coordinator for delivery to every member.
    ///
    /// Returns once the coordinator has accepted it. Waits while the command
    /// channel is full.
    ///
    /// # Errors
    ///
    /// - [`HubError::ShutDown`]: the hub is shut down
    /// - [`HubError::Serialization`]: the envelope could not be encoded
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<(), HubError> {
        let frame = envelope.to_frame()?;
        self.submit(Command::Broadcast { frame, done: None }).await
    }

    /// Like [`broadcast`](Self::broadcast), but waits for delivery.
    ///
    /// # Errors
    ///
    /// Same as [`broadcast`](Self::broadcast).
    pub async fn broadcast_confirmed(&self, envelope: &Envelope) -> Result<BroadcastReport, HubError> {
        let frame = envelope.to_frame()?;
        let (done, report) = oneshot::channel();
        self.submit(Command::Broadcast {
            frame,
            done: Some(done),
        })
        .await?;
        report.await.map_err(|_| HubError::ShutDown)
    }

    /// Register a connection and supervise it until it goes away.
    ///
    /// Spawns a read loop, which extends the read deadline on every inbound
    /// frame, and a heartbeat task. Both share one cancellation token and
    /// either one may unregister the connection.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub async fn serve<S>(&self, conn: Arc<dyn Connection>, inbound: S) -> Result<ConnectionId, HubError>
    where
        S: Stream<Item = Result<Inbound, HubError>> + Send + 'static,
    {
        let (id, token) = self.register_member(Arc::clone(&conn)).await?;

        self.inner
            .tasks
            .spawn(heartbeat(self.clone(), id, conn, token.clone()));
        self.inner
            .tasks
            .spawn(read_loop(self.clone(), id, inbound, token));

        info!(connection_id = %id, live = self.live_count(), "Observer connected");
        Ok(id)
    }

    /// Forward allow-listed events from `bus` to every observer.
    pub fn subscribe_to(&self, bus: &EventBus) {
        let handler: Arc<dyn EventHandler> = Arc::new(HubHandler { hub: self.clone() });
        bus.subscribe_many(&broadcast_allow_list(), &handler);
    }

    /// Forward captured log lines to every observer.
    pub fn attach_log_stream(&self, mut lines: broadcast::Receiver<LogLine>) {
        let hub = self.clone();
        let token = self.inner.token.clone();
        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    line = lines.recv() => match line {
                        Ok(line) => {
                            let envelope = match Envelope::log(&line) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    warn!(error = %e, "Dropping unencodable log line");
                                    continue;
                                }
                            };
                            if hub.broadcast(&envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Log stream lagged, lines dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Log stream detached");
        });
    }

    /// Close every connection and stop the coordinator.
    ///
    /// Safe to call more than once. Returns after the coordinator and all
    /// per-connection tasks have finished.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Broadcast hub already shut down");
            return;
        }

        info!(live = self.live_count(), "Broadcast hub shutting down");
        self.inner.token.cancel();

        let handle = lock(&self.inner.coordinator).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Hub coordinator ended abnormally");
            }
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Broadcast hub stopped");
    }
}

async fn heartbeat(hub: BroadcastHub, id: ConnectionId, conn: Arc<dyn Connection>, token: CancellationToken) {
    let period = hub.inner.config.heartbeat_interval();
    let write_timeout = hub.inner.config.write_timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let frame = match Envelope::ping(Utc::now()).to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Heartbeat encoding failed");
                        continue;
                    }
                };
                match tokio::time::timeout(write_timeout, conn.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "Heartbeat write failed");
                        break;
                    }
                    Err(_) => {
                        debug!(connection_id = %id, "Heartbeat write timed out");
                        break;
                    }
                }
            }
        }
    }

    token.cancel();
    hub.unregister(id).await;
}

async fn read_loop<S>(hub: BroadcastHub, id: ConnectionId, inbound: S, token: CancellationToken)
where
    S: Stream<Item = Result<Inbound, HubError>> + Send + 'static,
{
    let read_timeout = hub.inner.config.read_timeout;
    let mut inbound = Box::pin(inbound);
    let deadline = tokio::time::sleep(read_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = &mut deadline => {
                debug!(connection_id = %id, "Read deadline expired");
                break;
            }
            frame = inbound.next() => match frame {
                Some(Ok(Inbound::Message)) => deadline.as_mut().reset(Instant::now() + read_timeout),
                Some(Ok(Inbound::Close)) | None => {
                    debug!(connection_id = %id, "Connection closed by peer");
                    break;
                }
                Some(Err(e)) => {
                    debug!(connection_id = %id, error = %e, "Read failed");
                    break;
                }
            },
        }
    }

    token.cancel();
    hub.unregister(id).await;
}

/// Bus subscriber that hands events to the coordinator.
struct HubHandler {
    hub: BroadcastHub,
}

impl EventHandler for HubHandler {
    fn name(&self) -> &str {
        "broadcast_hub"
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            let envelope = Envelope::event(event).map_err(|e| HandlerError::new(e.to_string()))?;
            match self.hub.broadcast(&envelope).await {
                Ok(()) | Err(HubError::ShutDown) => Ok(()),
                Err(e) => Err(HandlerError::new(e.to_string())),
            }
        })
    }
}
