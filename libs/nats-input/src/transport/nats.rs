//! `async-nats` backed transport.
//!
//! Reconnection is owned by the connection manager: when the client reports
//! a disconnect the manager drops it and establishes a fresh one. The
//! client's own reconnect loop is capped so a dropped client winds down
//! instead of retrying in the background.

use std::time::Duration;

use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use config::ConnectionConfig;

use super::{
    Connection, Deliveries, Delivery, Transport, TransportError, TransportEvent, TransportEvents,
};

/// Default connection timeout for a single attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Reconnects the client tries on its own before closing. `0` would mean
/// unlimited to async-nats.
const CLIENT_MAX_RECONNECTS: usize = 1;
/// Upper bound on the flush made when closing; a dead connection never
/// answers it.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connects to real NATS servers.
#[derive(Debug, Clone)]
pub struct NatsTransport {
    connect_timeout: Duration,
}

impl Default for NatsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NatsTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Timeout for a single connection attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build connect options from the connection config, applying TLS and
    /// routing client events into `events`.
    fn build_connect_options(
        &self,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> ConnectOptions {
        let mut opts = ConnectOptions::new();

        if let Some(name) = &config.client_name {
            opts = opts.name(name);
        }
        if config.use_tls {
            if let Some((cert, key)) = &config.tls.client_cert {
                opts = opts.add_client_certificate(cert.clone(), key.clone());
            }
            if let Some(ca) = &config.tls.ca_file {
                opts = opts.add_root_certificates(ca.clone());
            }
            opts = opts.require_tls(true);
        }
        if config.verbose_ack {
            warn!("'verbose' is not supported by the NATS client and is ignored");
        }
        if config.strict_protocol {
            warn!("'pedantic' is not supported by the NATS client and is ignored");
        }

        opts.connection_timeout(self.connect_timeout)
            .max_reconnects(CLIENT_MAX_RECONNECTS)
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    if let Some(event) = map_event(event) {
                        // receiver gone means the connection was already torn down
                        let _ = events.send(event);
                    }
                }
            })
    }
}

fn map_event(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Connected => {
            debug!("NATS client connected");
            None
        }
        Event::Disconnected => Some(TransportEvent::Disconnected(
            "connection to NATS server lost".to_owned(),
        )),
        Event::SlowConsumer(sid) => Some(TransportEvent::Warning(format!(
            "slow consumer on subscription {sid}, messages dropped"
        ))),
        Event::LameDuckMode => Some(TransportEvent::Warning(
            "server entered lame duck mode".to_owned(),
        )),
        Event::ServerError(err) => Some(TransportEvent::Error(format!("server error: {err}"))),
        Event::ClientError(err) => Some(TransportEvent::Error(format!("client error: {err}"))),
        other => {
            debug!(event = ?other, "NATS client event");
            None
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    type Connection = NatsConnection;

    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(NatsConnection, TransportEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self
            .build_connect_options(config, tx)
            .connect(config.servers.clone())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok((NatsConnection { client }, rx))
    }
}

/// One `async-nats` client.
#[derive(Debug, Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
}

#[async_trait]
impl Connection for NatsConnection {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Deliveries, TransportError> {
        let subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_owned(), group.to_owned())
                    .await
            }
            None => self.client.subscribe(subject.to_owned()).await,
        }
        .map_err(|err| TransportError::Subscribe(err.to_string()))?;

        Ok(subscriber
            .map(|msg| Delivery {
                subject: msg.subject.to_string(),
                payload: msg.payload,
                reply: msg.reply.map(|reply| reply.to_string()),
            })
            .boxed())
    }

    async fn close(&self) {
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.client.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "flush on close failed"),
            Err(_) => debug!("flush on close timed out, connection presumed dead"),
        }
    }
}
