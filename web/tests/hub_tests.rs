//! Broadcast hub behavior against mock connections.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use chrono::Utc;
use healwatch_core::event::{DomainEvent, EventData, EventType};
use healwatch_core::event_bus::EventBus;
use healwatch_testing::helpers::detected;
use healwatch_testing::{InMemoryEventLog, MockConnection, inbound_channel};
use healwatch_web::hub::Connection;
use healwatch_web::{BroadcastHub, Envelope, HubConfig, HubError, Inbound, LogLine};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn hub_with(n: usize) -> (BroadcastHub, Vec<Arc<MockConnection>>) {
    let hub = BroadcastHub::new(HubConfig::default());
    let mut conns = Vec::with_capacity(n);
    for _ in 0..n {
        let conn = Arc::new(MockConnection::new());
        hub.register(conn.clone()).await.unwrap();
        conns.push(conn);
    }
    (hub, conns)
}

fn short_reads(read_timeout: Duration) -> HubConfig {
    HubConfig {
        read_timeout,
        write_timeout: Duration::from_secs(1),
        command_capacity: 16,
    }
}

/// Poll until `check` holds or a second has passed.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn every_member_receives_identical_bytes() {
    let (hub, conns) = hub_with(5).await;

    let report = hub
        .broadcast_confirmed(&Envelope::new("test", "hello"))
        .await
        .unwrap();

    assert_eq!(report.delivered, 5);
    assert_eq!(report.evicted, 0);
    for conn in &conns {
        assert_eq!(conn.payload_frames(), vec![r#"{"type":"test","data":"hello"}"#.to_string()]);
    }
    hub.shutdown().await;
}

#[tokio::test]
async fn failing_member_is_evicted_and_others_continue() {
    let (hub, conns) = hub_with(5).await;
    conns[2].fail_sends(true);

    let report = hub
        .broadcast_confirmed(&Envelope::new("test", "first"))
        .await
        .unwrap();
    assert_eq!(report.delivered, 4);
    assert_eq!(report.evicted, 1);
    assert_eq!(hub.live_count(), 4);
    assert_eq!(conns[2].close_count(), 1);

    let next = hub
        .broadcast_confirmed(&Envelope::new("test", "second"))
        .await
        .unwrap();
    assert_eq!(next.delivered, 4);
    assert!(conns[2].payload_frames().is_empty());
    assert_eq!(conns[0].payload_frames().len(), 2);
    hub.shutdown().await;
}

#[tokio::test]
async fn slow_member_times_out_without_blocking_others() {
    let hub = BroadcastHub::new(HubConfig {
        read_timeout: Duration::from_secs(60),
        write_timeout: Duration::from_millis(100),
        command_capacity: 16,
    });
    let mut conns = Vec::new();
    for _ in 0..3 {
        let conn = Arc::new(MockConnection::new());
        hub.register(conn.clone()).await.unwrap();
        conns.push(conn);
    }
    conns[1].set_delay(Some(Duration::from_secs(5)));

    let started = std::time::Instant::now();
    let report = hub
        .broadcast_confirmed(&Envelope::new("test", "x"))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.evicted, 1);
    assert_eq!(hub.live_count(), 2);
    assert_eq!(conns[1].close_count(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn slow_handshake_is_refused() {
    let hub = BroadcastHub::new(HubConfig {
        read_timeout: Duration::from_secs(60),
        write_timeout: Duration::from_millis(50),
        command_capacity: 16,
    });
    let conn = Arc::new(MockConnection::slow(Duration::from_secs(5)));

    let refused = hub.register(conn.clone()).await;

    assert!(matches!(refused, Err(HubError::WriteTimeout(_))));
    assert_eq!(conn.close_count(), 1);
    assert_eq!(hub.live_count(), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn unregister_twice_is_a_noop() {
    let hub = BroadcastHub::new(HubConfig::default());
    let conn = Arc::new(MockConnection::new());
    let id = hub.register(conn.clone()).await.unwrap();

    assert!(hub.unregister(id).await);
    assert!(!hub.unregister(id).await);
    assert_eq!(conn.close_count(), 1);
    assert_eq!(hub.live_count(), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_everyone_once() {
    let (hub, conns) = hub_with(3).await;

    hub.shutdown().await;
    hub.shutdown().await;

    assert!(hub.is_shut_down());
    assert_eq!(hub.live_count(), 0);
    for conn in &conns {
        assert_eq!(conn.close_count(), 1);
    }
    assert!(matches!(
        hub.broadcast(&Envelope::new("test", "late")).await,
        Err(HubError::ShutDown)
    ));
}

#[tokio::test]
async fn silent_connection_is_dropped_after_read_timeout() {
    let hub = BroadcastHub::new(short_reads(Duration::from_millis(150)));
    let conn = Arc::new(MockConnection::new());
    let (_tx, rx) = inbound_channel();

    hub.serve(conn.clone(), rx).await.unwrap();
    assert_eq!(hub.live_count(), 1);

    assert!(eventually(|| hub.live_count() == 0).await);
    assert_eq!(conn.close_count(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn inbound_traffic_extends_the_deadline() {
    let hub = BroadcastHub::new(short_reads(Duration::from_millis(200)));
    let conn = Arc::new(MockConnection::new());
    let (tx, rx) = inbound_channel();
    hub.serve(conn.clone(), rx).await.unwrap();

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.unbounded_send(Ok(Inbound::Message)).unwrap();
    }
    assert_eq!(hub.live_count(), 1);

    tx.unbounded_send(Ok(Inbound::Close)).unwrap();
    assert!(eventually(|| hub.live_count() == 0).await);
    assert_eq!(conn.close_count(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn heartbeat_pings_live_connections() {
    let hub = BroadcastHub::new(short_reads(Duration::from_millis(100)));
    let conn = Arc::new(MockConnection::new());
    let (tx, rx) = inbound_channel();
    hub.serve(conn.clone(), rx).await.unwrap();

    // keep the read side alive while the 90ms heartbeat fires
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.unbounded_send(Ok(Inbound::Message)).unwrap();
    }

    assert!(!conn.frames_of_type("ping").is_empty());
    hub.shutdown().await;
    assert_eq!(conn.close_count(), 1);
}

#[tokio::test]
async fn failed_heartbeat_unregisters_once() {
    let hub = BroadcastHub::new(short_reads(Duration::from_millis(100)));
    let conn = Arc::new(MockConnection::new());
    let (tx, rx) = inbound_channel();
    hub.serve(conn.clone(), rx).await.unwrap();
    conn.fail_sends(true);

    // the read side stays healthy, so only the heartbeat can drop it
    for _ in 0..25 {
        if hub.live_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.unbounded_send(Ok(Inbound::Message));
    }

    assert_eq!(hub.live_count(), 0);
    assert!(eventually(|| conn.close_count() == 1).await);
    assert!(eventually(|| hub.task_count() == 0).await);
    hub.shutdown().await;
    assert_eq!(conn.close_count(), 1);
}

#[tokio::test]
async fn shutdown_stops_every_connection_task() {
    let hub = BroadcastHub::new(HubConfig::default());
    let mut conns = Vec::new();
    let mut senders = Vec::new();
    for _ in 0..3 {
        let conn = Arc::new(MockConnection::new());
        let (tx, rx) = inbound_channel();
        hub.serve(conn.clone(), rx).await.unwrap();
        conns.push(conn);
        senders.push(tx);
    }
    assert_eq!(hub.live_count(), 3);
    assert_eq!(hub.task_count(), 6);

    hub.shutdown().await;

    assert_eq!(hub.live_count(), 0);
    assert_eq!(hub.task_count(), 0);
    for conn in &conns {
        assert_eq!(conn.close_count(), 1);
    }
}

#[tokio::test]
async fn read_error_unregisters() {
    let hub = BroadcastHub::new(HubConfig::default());
    let conn = Arc::new(MockConnection::new());
    let (tx, rx) = inbound_channel();
    hub.serve(conn.clone(), rx).await.unwrap();

    tx.unbounded_send(Err(HubError::Read("reset by peer".to_string())))
        .unwrap();

    assert!(eventually(|| hub.live_count() == 0).await);
    assert_eq!(conn.close_count(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn bus_events_are_forwarded() {
    let log = Arc::new(InMemoryEventLog::new());
    let bus = EventBus::new(log);
    let (hub, conns) = hub_with(2).await;
    hub.subscribe_to(&bus);

    bus.publish(detected("abc", "/movies/a.mkv", 1)).await.unwrap();
    bus.publish(DomainEvent::corruption(
        "abc",
        EventType::Other("Unlisted".to_string()),
        EventData::new(),
    ))
    .await
    .unwrap();
    // commands are handled in order, so this waits for the forwarded event
    hub.broadcast_confirmed(&Envelope::new("marker", Value::Null))
        .await
        .unwrap();

    for conn in &conns {
        let events = conn.frames_of_type("event");
        assert_eq!(events.len(), 1);
        let frame: Value = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(frame["data"]["eventType"], "CorruptionDetected");
        assert_eq!(frame["data"]["aggregateId"], "abc");
    }

    hub.shutdown().await;
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn log_lines_are_forwarded() {
    let (hub, conns) = hub_with(1).await;
    let (tx, rx) = broadcast::channel(8);
    hub.attach_log_stream(rx);

    tx.send(LogLine {
        timestamp: Utc::now(),
        level: "INFO".to_string(),
        target: "healwatch_server".to_string(),
        message: "scan finished".to_string(),
        fields: serde_json::Map::new(),
    })
    .unwrap();

    assert!(eventually(|| !conns[0].frames_of_type("log").is_empty()).await);
    let frame: Value = serde_json::from_str(&conns[0].frames_of_type("log")[0]).unwrap();
    assert_eq!(frame["data"]["message"], "scan finished");
    hub.shutdown().await;
}

#[tokio::test]
async fn unregistering_during_broadcasts_is_safe() {
    let hub = BroadcastHub::new(HubConfig::default());
    let mut leaving = Vec::new();
    let mut staying = Vec::new();
    for i in 0..16 {
        let conn = Arc::new(MockConnection::new());
        let id = hub.register(conn.clone() as Arc<dyn Connection>).await.unwrap();
        if i % 2 == 0 {
            leaving.push((id, conn));
        } else {
            staying.push(conn);
        }
    }

    let broadcaster = {
        let hub = hub.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                hub.broadcast(&Envelope::new("test", i)).await.unwrap();
            }
        })
    };
    for (id, _) in &leaving {
        assert!(hub.unregister(*id).await);
    }
    broadcaster.await.unwrap();

    let report = hub
        .broadcast_confirmed(&Envelope::new("test", "end"))
        .await
        .unwrap();
    assert_eq!(report.delivered, 8);
    for (_, conn) in &leaving {
        assert_eq!(conn.close_count(), 1);
    }
    for conn in &staying {
        assert_eq!(conn.payload_frames().len(), 21);
    }
    hub.shutdown().await;
}
