//! The async-nats transport against a minimal server speaking the NATS text
//! protocol over TCP.
mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use config::ConnectionConfig;
use ingest_core::{Decoration, Severity, codec::CodecKind};
use nats_input::{ConnectionState, IngestError, MessageHandler, NatsInput, NatsTransport};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;

const INFO: &[u8] = b"INFO {\"server_id\":\"ingest-test\",\"server_name\":\"ingest-test\",\
\"version\":\"2.10.0\",\"proto\":1,\"host\":\"127.0.0.1\",\"port\":4222,\
\"headers\":true,\"max_payload\":1048576}\r\n";

/// Accept one client, complete the handshake, then go away for good: the
/// listener is dropped before the client is, so every later connect is
/// refused.
async fn serve_one_client(listener: TcpListener) -> bool {
    let Ok((stream, _)) = listener.accept().await else {
        return false;
    };
    drop(listener);

    let (read, mut write) = stream.into_split();
    if write.write_all(INFO).await.is_err() {
        return false;
    }
    let mut lines = BufReader::new(read).lines();
    let mut ponged = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if line.starts_with("PING") {
            ponged = write.write_all(b"PONG\r\n").await.is_ok();
            break;
        }
    }
    // let the client subscribe before dropping it
    tokio::time::sleep(Duration::from_millis(300)).await;
    ponged
}

#[tokio::test]
async fn test_server_gone_exhausts_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_one_client(listener));

    let (sink, _events) = RecordingSink::new();
    let reporter = Arc::new(CollectReporter::default());
    let handler = MessageHandler::new(
        CodecKind::Json.build(),
        Arc::new(Decoration::default()),
        sink,
        reporter.clone(),
    );
    let config = ConnectionConfig {
        servers: vec![format!("nats://{addr}")],
        max_reconnect_attempts: Some(1),
        reconnect_wait: Some(Duration::from_millis(50)),
        ..ConnectionConfig::default()
    };
    let input = NatsInput::new(
        NatsTransport::new().with_connect_timeout(Duration::from_millis(500)),
        config,
        subs(&["orders"]),
        handler,
        reporter.clone(),
    );
    let state = input.watch_state();
    let task = tokio::spawn(input.run(CancellationToken::new()));

    let res = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("input kept waiting on a dead connection")
        .expect("input task panicked");
    assert!(server.await.unwrap(), "client never completed the handshake");
    assert!(matches!(
        res,
        Err(IngestError::ReconnectExhausted { attempts: 1, .. })
    ));
    assert_eq!(*state.borrow(), ConnectionState::Failed);
    assert!(
        reporter
            .with_severity(Severity::Warning)
            .iter()
            .any(|report| report.message.contains("connection lost"))
    );
    assert_eq!(reporter.with_severity(Severity::Fatal).len(), 1);
}
