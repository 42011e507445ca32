//! NATS connection manager with a fixed-wait reconnect policy.
//!
//! Owns the connection lifecycle and the observable [`ConnectionState`]. The
//! transport only ever makes single attempts; retrying, waiting between
//! attempts and deciding when to give up happen here.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use ingest_core::{ErrorReporter, Report, Severity, metrics};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use config::ConnectionConfig;

use crate::{
    error::{IngestError, IngestResult},
    transport::{Connection, Transport, TransportEvents},
};

/// Wait between attempts if not configured.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// Connection state observable by the ingest loop and health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; never connected or shut down.
    Disconnected,
    /// Making the initial connection.
    Connecting,
    /// Connected and delivering.
    Connected,
    /// Re-establishing a dropped connection.
    Reconnecting,
    /// Gave up after exhausting the reconnect policy.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many attempts to make and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub wait: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            wait: DEFAULT_RECONNECT_WAIT,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            wait: config.reconnect_wait.unwrap_or(DEFAULT_RECONNECT_WAIT),
        }
    }

    /// Attempt budget for one connect sequence. The initial connect gets one
    /// attempt on top of the reconnect attempts.
    pub fn budget(&self, initial: bool) -> Option<u32> {
        self.max_attempts
            .map(|max| if initial { max.saturating_add(1) } else { max })
    }
}

/// A fresh connection and the events it will report.
pub struct Established<C> {
    pub connection: Arc<C>,
    pub events: TransportEvents,
}

/// Connection manager for the NATS input.
///
/// Provides:
/// - Initial connect with retries per the [`ReconnectPolicy`]
/// - Reconnect after a dropped connection, discarding the old handle
/// - Current connection state, as a value and as a `watch` channel
/// - A fatal report and [`IngestError::ReconnectExhausted`] when the
///   policy runs out
pub struct ConnectionManager<T: Transport> {
    transport: T,
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    connection: RwLock<Option<Arc<T::Connection>>>,
    attempts: AtomicU32,
    reporter: Arc<dyn ErrorReporter>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager without connecting yet.
    pub fn new(transport: T, config: ConnectionConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        let policy = ReconnectPolicy::from_config(&config);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            policy,
            state,
            connection: RwLock::new(None),
            attempts: AtomicU32::new(0),
            reporter,
        }
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Total connection attempts so far, initial and reconnects.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Current connection handle, if connected.
    pub async fn connection(&self) -> Option<Arc<T::Connection>> {
        self.connection.read().await.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(?prev, ?state, "connection state changed");
        }
        metrics::CONNECTION_STATE.set(i64::from(state == ConnectionState::Connected));
    }

    /// Establish the initial connection.
    ///
    /// The first attempt is immediate, then up to `max_attempts` retries each
    /// after `wait`. Returns `Ok(None)` if `token` is cancelled first.
    pub async fn connect(
        &self,
        token: &CancellationToken,
    ) -> IngestResult<Option<Established<T::Connection>>> {
        if let Some(old) = self.connection.write().await.take() {
            debug!("dropping existing connection before connect");
            old.close().await;
        }
        info!(
            servers = ?self.config.servers,
            max_reconnect_attempts = ?self.policy.max_attempts,
            reconnect_wait_ms = self.policy.wait.as_millis(),
            "connecting to NATS"
        );
        self.establish(true, token).await
    }

    /// Discard the current connection and establish a new one. Every attempt
    /// is preceded by the configured wait.
    ///
    /// The state is `Reconnecting` from the start, while the lost handle is
    /// still being closed.
    pub async fn reconnect(
        &self,
        token: &CancellationToken,
    ) -> IngestResult<Option<Established<T::Connection>>> {
        self.set_state(ConnectionState::Reconnecting);
        let lost = self.connection.write().await.take();
        if let Some(old) = lost {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("cancelled while closing the lost connection");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(None);
                }
                _ = old.close() => {}
            }
        }
        info!(
            max_reconnect_attempts = ?self.policy.max_attempts,
            "reconnecting to NATS"
        );
        self.establish(false, token).await
    }

    /// Close the current connection, if any.
    pub async fn close(&self) {
        if let Some(conn) = self.connection.write().await.take() {
            conn.close().await;
            info!("NATS connection closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn establish(
        &self,
        initial: bool,
        token: &CancellationToken,
    ) -> IngestResult<Option<Established<T::Connection>>> {
        self.set_state(if initial {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let budget = self.policy.budget(initial);
        let mut attempt: u32 = 0;
        let mut last_error = String::from("no attempt made");
        loop {
            if budget.is_some_and(|budget| attempt >= budget) {
                break;
            }
            if attempt > 0 || !initial {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("cancelled while waiting to connect");
                        self.set_state(ConnectionState::Disconnected);
                        return Ok(None);
                    }
                    _ = tokio::time::sleep(self.policy.wait) => {}
                }
            }

            attempt += 1;
            self.attempts.fetch_add(1, Ordering::SeqCst);
            metrics::CONNECT_ATTEMPTS.inc();

            let res = tokio::select! {
                _ = token.cancelled() => {
                    debug!("cancelled while connecting");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(None);
                }
                res = self.transport.connect(&self.config) => res,
            };
            match res {
                Ok((conn, events)) => {
                    let conn = Arc::new(conn);
                    *self.connection.write().await = Some(Arc::clone(&conn));
                    self.set_state(ConnectionState::Connected);
                    if initial {
                        info!(attempt, "NATS connection established");
                    } else {
                        metrics::RECONNECTS.inc();
                        self.reporter.report(&Report::new(
                            Severity::Info,
                            format!("NATS connection restored after {attempt} attempt(s)"),
                        ));
                    }
                    return Ok(Some(Established {
                        connection: conn,
                        events,
                    }));
                }
                Err(err) => {
                    let err = IngestError::Connect(err.to_string());
                    warn!(
                        attempt,
                        budget = ?budget,
                        retry_in_ms = self.policy.wait.as_millis(),
                        error = %err,
                        "NATS connection attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        error!(attempts = attempt, error = %last_error, "NATS connection failed after all attempts");
        let err = IngestError::ReconnectExhausted {
            attempts: attempt,
            last_error,
        };
        self.reporter
            .report(&Report::new(Severity::Fatal, "giving up on NATS connection").error(&err));
        Err(err)
    }
}
