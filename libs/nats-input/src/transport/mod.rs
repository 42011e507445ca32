//! Broker transport seam.
//!
//! The input only needs three things from the bus: connect, subscribe to a
//! subject (optionally in a queue group) and close. [`nats::NatsTransport`]
//! provides them over `async-nats`, [`memory::MemoryTransport`] is an
//! in-process broker.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;

use config::ConnectionConfig;

pub mod memory;
pub mod nats;

/// One message delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Subject the message was published on. Differs from the subscription
    /// subject when that one has wildcards.
    pub subject: String,
    pub payload: Bytes,
    pub reply: Option<String>,
}

/// Ordered stream of deliveries for one subscription. Dropping it releases
/// the subscription.
pub type Deliveries = BoxStream<'static, Delivery>;

/// Asynchronous, connection-level notifications from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection dropped; every subscription on it is dead.
    Disconnected(String),
    /// Non-fatal condition, e.g. slow consumer or lame duck mode.
    Warning(String),
    /// Error reported by the server or client asynchronously. Does not end
    /// the connection by itself.
    Error(String),
}

/// Receiving half of a connection's event channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport operation failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection attempt failed (network, auth, handshake).
    #[error("connect failed: {0}")]
    Connect(String),

    /// Subscribe call rejected.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Connection is already closed.
    #[error("connection closed")]
    Closed,
}

/// Establishes connections to the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Live connection type.
    type Connection: Connection;

    /// Make one connection attempt. Retrying is the caller's job.
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Self::Connection, TransportEvents), TransportError>;
}

/// A live broker connection, shared read-only by the subscriptions on it.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Register one subscription. With a queue group, each message is given
    /// to one member of the group; without one, every subscription gets a copy.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Deliveries, TransportError>;

    /// Close the connection. Subscriptions on it end.
    async fn close(&self);
}
