//! # nats-input
//!
//! Subscribes to NATS subjects and turns every delivered message into
//! events for a downstream pipeline.
//!
//! This library provides:
//! - **Transport seam** with an `async-nats` implementation and an
//!   in-process broker.
//! - **Connection manager** with a fixed-wait, bounded or unbounded
//!   reconnect policy and an observable connection state.
//! - **Subscription set** registering every configured subject, with an
//!   optional queue group, and running one ordered worker per subscription.
//! - **Message handler** decoding payloads, decorating events, tagging them
//!   with `nats_subject` and appending them to the sink.
//! - **Ingest loop** tying the above together, reconnecting on loss and
//!   returning only on cancellation or a fatal error.

pub mod client;
pub mod error;
pub mod handler;
pub mod input;
pub mod subscription;
pub mod transport;

pub use client::{ConnectionManager, ConnectionState, Established, ReconnectPolicy};
pub use error::{IngestError, IngestResult};
pub use handler::MessageHandler;
pub use input::NatsInput;
pub use subscription::{SubscriptionSet, WorkerExit};
pub use transport::{
    Connection, Delivery, Transport, TransportError, TransportEvent,
    memory::MemoryTransport,
    nats::{NatsConnection, NatsTransport},
};
