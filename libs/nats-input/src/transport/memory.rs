//! In-process broker.
//!
//! Implements NATS subject semantics (`*` matches one token, `>` matches the
//! rest), fan-out to plain subscribers and round-robin within queue groups.
//! The broker can be made unavailable, forced to drop every connection or
//! told to reject subscriptions, which is how the connection lifecycle is
//! exercised without a server.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use config::ConnectionConfig;

use super::{
    Connection, Deliveries, Delivery, Transport, TransportError, TransportEvent, TransportEvents,
};

/// Per-subscription buffer.
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Cheap to clone; clones share one broker.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Broker>,
}

#[derive(Debug)]
struct Broker {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicU32,
    stall_closes: AtomicBool,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    next_id: u64,
    connections: HashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
    subscriptions: Vec<Subscription>,
    /// next member index per (subject, queue group)
    cursors: HashMap<(String, String), usize>,
    rejected: HashSet<String>,
    subscribe_calls: Vec<(String, Option<String>)>,
}

#[derive(Debug)]
struct Subscription {
    connection: u64,
    subject: String,
    queue_group: Option<String>,
    tx: mpsc::Sender<Delivery>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// New broker, accepting connections.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Broker {
                state: Mutex::new(BrokerState {
                    available: true,
                    next_id: 0,
                    connections: HashMap::new(),
                    subscriptions: Vec::new(),
                    cursors: HashMap::new(),
                    rejected: HashSet::new(),
                    subscribe_calls: Vec::new(),
                }),
                connect_attempts: AtomicU32::new(0),
                stall_closes: AtomicBool::new(false),
            }),
        }
    }

    /// New broker that refuses connections until [`set_available`](Self::set_available).
    pub fn unavailable() -> Self {
        let broker = Self::new();
        broker.set_available(false);
        broker
    }

    /// Accept or refuse new connections. Existing connections are untouched.
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().available = available;
    }

    /// Total connect calls seen, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Live subscriptions registered with exactly `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|sub| sub.subject == subject && !sub.tx.is_closed())
            .count()
    }

    /// Every subscribe call in order, including rejected ones.
    pub fn subscribe_calls(&self) -> Vec<(String, Option<String>)> {
        self.inner.state.lock().subscribe_calls.clone()
    }

    /// Make `close` on an already dropped connection never return, the way a
    /// flush on a dead socket waits for a reply that never comes.
    pub fn stall_closes(&self, stall: bool) {
        self.inner.stall_closes.store(stall, Ordering::SeqCst);
    }

    /// Reject future subscriptions to `subject`.
    pub fn reject_subscriptions_to(&self, subject: impl Into<String>) {
        self.inner.state.lock().rejected.insert(subject.into());
    }

    /// Publish `payload` on `subject`, returning how many subscriptions got it.
    /// Waits for room when a subscriber's buffer is full.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let targets = self.inner.state.lock().route(subject);
        let mut delivered = 0;
        for tx in targets {
            let delivery = Delivery {
                subject: subject.to_owned(),
                payload: payload.clone(),
                reply: None,
            };
            if tx.send(delivery).await.is_ok() {
                delivered += 1;
            }
        }
        trace!(subject, delivered, "published");
        delivered
    }

    /// Drop every connection, notifying each with a disconnect event. Their
    /// subscription streams end.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.inner.state.lock();
        for (id, events) in state.connections.drain() {
            debug!(connection = id, reason, "dropping connection");
            let _ = events.send(TransportEvent::Disconnected(reason.to_owned()));
        }
        state.subscriptions.clear();
    }

    /// Send a non-fatal event to every connection.
    pub fn notify_all(&self, event: TransportEvent) {
        for events in self.inner.state.lock().connections.values() {
            let _ = events.send(event.clone());
        }
    }
}

impl BrokerState {
    /// Senders that should get a message on `subject`: every plain
    /// subscription plus one member per queue group.
    fn route(&mut self, subject: &str) -> Vec<mpsc::Sender<Delivery>> {
        self.subscriptions.retain(|sub| !sub.tx.is_closed());

        let mut targets = Vec::new();
        let mut groups: HashMap<(String, String), Vec<mpsc::Sender<Delivery>>> = HashMap::new();
        for sub in self
            .subscriptions
            .iter()
            .filter(|sub| subject_matches(&sub.subject, subject))
        {
            match &sub.queue_group {
                Some(group) => groups
                    .entry((sub.subject.clone(), group.clone()))
                    .or_default()
                    .push(sub.tx.clone()),
                None => targets.push(sub.tx.clone()),
            }
        }
        for (key, mut members) in groups {
            let cursor = self.cursors.entry(key).or_insert(0);
            let idx = *cursor % members.len();
            *cursor = cursor.wrapping_add(1);
            targets.push(members.swap_remove(idx));
        }
        targets
    }
}

/// NATS subject matching. `*` matches exactly one token, a trailing `>`
/// matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => {}
            (token, Some(actual)) if token == actual => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(MemoryConnection, TransportEvents), TransportError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(TransportError::Connect(format!(
                "no servers available: {}",
                config.servers.join(", ")
            )));
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(id, tx);
        debug!(connection = id, "memory connection opened");
        Ok((
            MemoryConnection {
                id,
                broker: Arc::clone(&self.inner),
            },
            rx,
        ))
    }
}

/// Connection to a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    broker: Arc<Broker>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Deliveries, TransportError> {
        let mut state = self.broker.state.lock();
        state
            .subscribe_calls
            .push((subject.to_owned(), queue_group.map(str::to_owned)));
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        if state.rejected.contains(subject) {
            return Err(TransportError::Subscribe(format!(
                "permissions violation for subscription to '{subject}'"
            )));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        state.subscriptions.push(Subscription {
            connection: self.id,
            subject: subject.to_owned(),
            queue_group: queue_group.map(str::to_owned),
            tx,
        });
        drop(state);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn close(&self) {
        let dropped = {
            let mut state = self.broker.state.lock();
            state.subscriptions.retain(|sub| sub.connection != self.id);
            let live = state.connections.remove(&self.id).is_some();
            if live {
                debug!(connection = self.id, "memory connection closed");
            }
            !live
        };
        if dropped && self.broker.stall_closes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}
