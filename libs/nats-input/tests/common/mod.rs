#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use config::{ConnectionConfig, SubjectSubscription};
use ingest_core::{
    Decoration, ErrorReporter, Event, OutputSink, Report, Severity, async_trait,
    codec::CodecKind, sink::SinkError,
};
use nats_input::{
    ConnectionState, IngestResult, MemoryTransport, MessageHandler, NatsInput,
};
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Records appended events and flags any append made while the input is not
/// connected. Appends can be held open to simulate a slow downstream.
#[derive(Debug)]
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<Event>,
    state: Mutex<Option<watch::Receiver<ConnectionState>>>,
    off_state_appends: AtomicUsize,
    closed: AtomicBool,
    held: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx,
            state: Mutex::new(None),
            off_state_appends: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            held: AtomicBool::new(false),
            entered: Notify::new(),
            released: Notify::new(),
        });
        (sink, rx)
    }

    pub fn observe(&self, state: watch::Receiver<ConnectionState>) {
        *self.state.lock() = Some(state);
    }

    pub fn off_state_appends(&self) -> usize {
        self.off_state_appends.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Block the next append until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let a held append complete.
    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }

    /// Wait until an append is blocked on [`hold`](Self::hold).
    pub async fn wait_held(&self) {
        tokio::time::timeout(TIMEOUT, self.entered.notified())
            .await
            .expect("timed out waiting for a held append");
    }
}

#[async_trait]
impl OutputSink for RecordingSink {
    async fn append(&self, event: Event) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        if self.held.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        let connected = self
            .state
            .lock()
            .as_ref()
            .is_none_or(|state| *state.borrow() == ConnectionState::Connected);
        if !connected {
            self.off_state_appends.fetch_add(1, Ordering::SeqCst);
        }
        self.tx.send(event).map_err(|_| SinkError::Closed)
    }
}

#[derive(Debug, Default)]
pub struct CollectReporter(Mutex<Vec<Report>>);

impl CollectReporter {
    pub fn reports(&self) -> Vec<Report> {
        self.0.lock().clone()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<Report> {
        self.0
            .lock()
            .iter()
            .filter(|report| report.severity == severity)
            .cloned()
            .collect()
    }
}

impl ErrorReporter for CollectReporter {
    fn report(&self, report: &Report) {
        self.0.lock().push(report.clone());
    }
}

pub fn subs(subjects: &[&str]) -> Vec<SubjectSubscription> {
    subjects.iter().map(|s| SubjectSubscription::new(*s)).collect()
}

pub fn connection(max_reconnect_attempts: Option<u32>) -> ConnectionConfig {
    ConnectionConfig {
        max_reconnect_attempts,
        reconnect_wait: Some(Duration::from_millis(10)),
        ..ConnectionConfig::default()
    }
}

/// A running input wired to a recording sink and a collecting reporter.
pub struct Harness {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub sink: Arc<RecordingSink>,
    pub reporter: Arc<CollectReporter>,
    pub state: watch::Receiver<ConnectionState>,
    pub token: CancellationToken,
    pub task: JoinHandle<IngestResult<()>>,
}

impl Harness {
    pub fn start(
        broker: &MemoryTransport,
        subscriptions: Vec<SubjectSubscription>,
        connection: ConnectionConfig,
        codec: CodecKind,
    ) -> Self {
        let (sink, events) = RecordingSink::new();
        let reporter = Arc::new(CollectReporter::default());
        let handler = MessageHandler::new(
            codec.build(),
            Arc::new(Decoration::default()),
            sink.clone(),
            reporter.clone(),
        );
        let input = NatsInput::new(
            broker.clone(),
            connection,
            subscriptions,
            handler,
            reporter.clone(),
        );
        let state = input.watch_state();
        sink.observe(state.clone());
        let token = CancellationToken::new();
        let task = tokio::spawn(input.run(token.clone()));
        Self {
            events,
            sink,
            reporter,
            state,
            token,
            task,
        }
    }

    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("sink channel closed")
    }

    pub async fn wait_for_state(&mut self, target: ConnectionState) {
        tokio::time::timeout(TIMEOUT, self.state.wait_for(|state| *state == target))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    pub async fn stop(self) -> IngestResult<()> {
        self.token.cancel();
        self.finish().await
    }

    pub async fn finish(self) -> IngestResult<()> {
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("input did not stop")
            .expect("input task panicked")
    }
}

/// Wait until `count` live subscriptions exist for `subject`.
pub async fn wait_subscribed(broker: &MemoryTransport, subject: &str, count: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while broker.subscriber_count(subject) != count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("timed out waiting for subscriptions");
}
