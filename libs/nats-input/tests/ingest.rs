mod common;

use std::{collections::BTreeSet, time::Duration};

use common::*;
use config::SubjectSubscription;
use ingest_core::{
    Severity,
    codec::CodecKind,
    event::{MESSAGE, NATS_SUBJECT, TIMESTAMP},
    serde_json::json,
};
use nats_input::{ConnectionState, IngestError, MemoryTransport, TransportEvent};

#[tokio::test]
/// a json object becomes one event carrying its fields plus the subject it
/// was published on
async fn test_json_payload_fields() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(
        &broker,
        subs(&["orders.*"]),
        connection(None),
        CodecKind::Json,
    );
    wait_subscribed(&broker, "orders.*", 1).await;

    broker
        .publish("orders.eu", r#"{"user": "ann", "count": 2}"#)
        .await;
    let event = input.next_event().await;
    assert_eq!(event.get("user"), Some(&json!("ann")));
    assert_eq!(event.get("count"), Some(&json!(2)));
    assert_eq!(event.get(NATS_SUBJECT), Some(&json!("orders.eu")));
    let fields: BTreeSet<&str> = event.fields().keys().map(String::as_str).collect();
    assert_eq!(
        fields,
        BTreeSet::from(["user", "count", NATS_SUBJECT, TIMESTAMP])
    );

    // arrays fan out into one event per element
    broker
        .publish("orders.us", r#"[{"id": 1}, {"id": 2}]"#)
        .await;
    for id in [1, 2] {
        let event = input.next_event().await;
        assert_eq!(event.get("id"), Some(&json!(id)));
        assert_eq!(event.get(NATS_SUBJECT), Some(&json!("orders.us")));
    }

    input.stop().await.unwrap();
}

#[tokio::test]
async fn test_per_subscription_order() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(&broker, subs(&["seq"]), connection(None), CodecKind::Plain);
    wait_subscribed(&broker, "seq", 1).await;

    for i in 0..100 {
        broker.publish("seq", i.to_string()).await;
    }
    for i in 0..100 {
        let event = input.next_event().await;
        assert_eq!(event.get(MESSAGE), Some(&json!(i.to_string())));
    }
    input.stop().await.unwrap();
}

#[tokio::test]
async fn test_bad_payload_is_isolated() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(&broker, subs(&["a", "b"]), connection(None), CodecKind::Json);
    wait_subscribed(&broker, "a", 1).await;
    wait_subscribed(&broker, "b", 1).await;

    broker.publish("a", "{broken").await;
    broker.publish("a", r#"{"ok": 1}"#).await;
    let event = input.next_event().await;
    assert_eq!(event.get("ok"), Some(&json!(1)));

    broker.publish("b", r#"{"ok": 2}"#).await;
    let event = input.next_event().await;
    assert_eq!(event.get("ok"), Some(&json!(2)));

    let errors = input.reporter.with_severity(Severity::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].subject.as_deref(), Some("a"));
    assert!(errors[0].error.is_some());
    assert_eq!(input.state.borrow().clone(), ConnectionState::Connected);

    input.stop().await.unwrap();
}

#[tokio::test]
/// after a forced disconnect every subject is subscribed again and messages
/// flow, with no append while the connection is down
async fn test_resubscribe_after_reconnect() {
    let broker = MemoryTransport::new();
    let subjects = ["orders", "metrics.>", "jobs"];
    let mut input = Harness::start(&broker, subs(&subjects), connection(None), CodecKind::Plain);
    for subject in subjects {
        wait_subscribed(&broker, subject, 1).await;
    }
    broker.publish("orders", "before").await;
    assert_eq!(input.next_event().await.get(MESSAGE), Some(&json!("before")));

    broker.disconnect_all("server restart");
    input.wait_for_state(ConnectionState::Reconnecting).await;
    input.wait_for_state(ConnectionState::Connected).await;
    for subject in subjects {
        wait_subscribed(&broker, subject, 1).await;
    }

    broker.publish("metrics.cpu", "after").await;
    let event = input.next_event().await;
    assert_eq!(event.get(MESSAGE), Some(&json!("after")));
    assert_eq!(event.get(NATS_SUBJECT), Some(&json!("metrics.cpu")));

    // 3 initial plus 3 after the reconnect
    assert_eq!(broker.subscribe_calls().len(), 6);
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(input.sink.off_state_appends(), 0);
    assert!(
        input
            .reporter
            .with_severity(Severity::Warning)
            .iter()
            .any(|report| report.message.contains("connection lost"))
    );
    input.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_exhausted() {
    let broker = MemoryTransport::unavailable();
    let input = Harness::start(&broker, subs(&["a"]), connection(Some(3)), CodecKind::Json);

    let err = input.task.await.unwrap().unwrap_err();
    assert!(matches!(err, IngestError::ReconnectExhausted { attempts: 4, .. }));
    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(*input.state.borrow(), ConnectionState::Failed);
    assert_eq!(input.reporter.with_severity(Severity::Fatal).len(), 1);
}

#[tokio::test]
async fn test_reconnect_exhausted() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(&broker, subs(&["a"]), connection(Some(3)), CodecKind::Json);
    wait_subscribed(&broker, "a", 1).await;

    broker.set_available(false);
    broker.disconnect_all("gone for good");
    input.wait_for_state(ConnectionState::Failed).await;

    let err = input.finish().await.unwrap_err();
    assert!(matches!(err, IngestError::ReconnectExhausted { attempts: 3, .. }));
    // one initial attempt plus three reconnect attempts
    assert_eq!(broker.connect_attempts(), 4);
}

#[tokio::test]
async fn test_zero_attempts_never_reconnects() {
    let broker = MemoryTransport::new();
    let input = Harness::start(&broker, subs(&["a"]), connection(Some(0)), CodecKind::Json);
    wait_subscribed(&broker, "a", 1).await;

    broker.disconnect_all("dropped");
    let err = input.finish().await.unwrap_err();
    assert!(matches!(err, IngestError::ReconnectExhausted { attempts: 0, .. }));
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_duplicate_subjects_both_fire() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(
        &broker,
        subs(&["orders", "orders"]),
        connection(None),
        CodecKind::Plain,
    );
    wait_subscribed(&broker, "orders", 2).await;

    assert_eq!(broker.publish("orders", "once").await, 2);
    for _ in 0..2 {
        let event = input.next_event().await;
        assert_eq!(event.get(MESSAGE), Some(&json!("once")));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(input.events.try_recv().is_err());
    input.stop().await.unwrap();
}

#[tokio::test]
async fn test_queue_group_splits_work() {
    let broker = MemoryTransport::new();
    let group = || vec![SubjectSubscription::new("jobs").with_queue_group("workers")];
    let mut first = Harness::start(&broker, group(), connection(None), CodecKind::Plain);
    let mut second = Harness::start(&broker, group(), connection(None), CodecKind::Plain);
    wait_subscribed(&broker, "jobs", 2).await;

    for i in 0..10 {
        assert_eq!(broker.publish("jobs", format!("job-{i}")).await, 1);
    }

    let message = |event: ingest_core::Event| {
        event
            .get(MESSAGE)
            .and_then(|value| value.as_str())
            .map(str::to_owned)
    };
    let mut seen = BTreeSet::new();
    while seen.len() < 10 {
        tokio::select! {
            Some(event) = first.events.recv() => { seen.insert(message(event)); }
            Some(event) = second.events.recv() => { seen.insert(message(event)); }
            _ = tokio::time::sleep(TIMEOUT) => panic!("timed out, got {} events", seen.len()),
        }
    }
    assert!(seen.iter().all(Option::is_some));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(first.events.try_recv().is_err());
    assert!(second.events.try_recv().is_err());

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_failure_is_fatal() {
    let broker = MemoryTransport::new();
    broker.reject_subscriptions_to("private");
    let input = Harness::start(
        &broker,
        subs(&["public", "private"]),
        connection(None),
        CodecKind::Json,
    );

    let reporter = input.reporter.clone();
    let err = input.finish().await.unwrap_err();
    assert!(matches!(err, IngestError::Subscribe { ref subject, .. } if subject == "private"));
    let fatal = reporter.with_severity(Severity::Fatal);
    assert_eq!(fatal.len(), 1);
    assert_eq!(fatal[0].subject.as_deref(), Some("private"));
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_transport_warnings_reported() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(&broker, subs(&["a"]), connection(None), CodecKind::Plain);
    wait_subscribed(&broker, "a", 1).await;

    broker.notify_all(TransportEvent::Warning("slow consumer".to_owned()));
    broker.notify_all(TransportEvent::Error("authorization violation".to_owned()));
    broker.publish("a", "still flowing").await;
    assert_eq!(
        input.next_event().await.get(MESSAGE),
        Some(&json!("still flowing"))
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    let reports = input.reporter.reports();
    assert!(reports.iter().any(|r| r.severity == Severity::Warning
        && r.error.as_deref() == Some("slow consumer")));
    assert!(reports.iter().any(|r| r.severity == Severity::Error
        && r.error.as_deref().is_some_and(|e| e.contains("authorization violation"))));
    assert_eq!(*input.state.borrow(), ConnectionState::Connected);
    input.stop().await.unwrap();
}

#[tokio::test]
async fn test_closed_sink_stops_ingestion() {
    let broker = MemoryTransport::new();
    let input = Harness::start(&broker, subs(&["a"]), connection(None), CodecKind::Plain);
    wait_subscribed(&broker, "a", 1).await;

    input.sink.close();
    broker.publish("a", "nowhere to go").await;
    let err = input.finish().await.unwrap_err();
    assert!(matches!(err, IngestError::Sink(_)));
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_cancel_closes_connection() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(&broker, subs(&["a"]), connection(None), CodecKind::Plain);
    input.wait_for_state(ConnectionState::Connected).await;
    wait_subscribed(&broker, "a", 1).await;

    let state = input.state.clone();
    input.stop().await.unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.subscriber_count("a"), 0);
}

#[tokio::test]
/// cancelling while an append is in flight waits for it, then closes
async fn test_cancel_drains_in_flight_message() {
    let broker = MemoryTransport::new();
    let mut input = Harness::start(&broker, subs(&["a"]), connection(None), CodecKind::Plain);
    wait_subscribed(&broker, "a", 1).await;

    input.sink.hold();
    broker.publish("a", "in flight").await;
    input.sink.wait_held().await;

    input.token.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!input.task.is_finished());
    assert_eq!(broker.connection_count(), 1);

    input.sink.release();
    assert_eq!(
        input.next_event().await.get(MESSAGE),
        Some(&json!("in flight"))
    );
    let sink = input.sink.clone();
    input.finish().await.unwrap();
    assert_eq!(sink.off_state_appends(), 0);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_connecting() {
    let broker = MemoryTransport::unavailable();
    let input = Harness::start(&broker, subs(&["a"]), connection(None), CodecKind::Plain);
    tokio::time::sleep(Duration::from_millis(55)).await;
    assert!(broker.connect_attempts() >= 1);

    input.stop().await.unwrap();
}
