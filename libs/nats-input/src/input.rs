//! The ingest loop: connect, subscribe, serve deliveries, reconnect on loss.

use std::sync::Arc;

use ingest_core::{ErrorReporter, OutputSink, Report, Severity, metrics};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::{ConnectionConfig, IngestConfig, SubjectSubscription};

use crate::{
    client::{ConnectionManager, ConnectionState},
    error::{IngestError, IngestResult},
    handler::MessageHandler,
    subscription::{SubscriptionSet, WorkerExit},
    transport::{Transport, TransportEvent, TransportEvents},
};

/// How serving one connection ended.
enum Served {
    Shutdown,
    Disconnected(String),
    Fatal(IngestError),
}

/// A NATS input: one connection, a fixed set of subscriptions, one handler.
pub struct NatsInput<T: Transport> {
    manager: ConnectionManager<T>,
    subscriptions: SubscriptionSet,
    handler: Arc<MessageHandler>,
    reporter: Arc<dyn ErrorReporter>,
}

impl<T: Transport> NatsInput<T> {
    pub fn new(
        transport: T,
        connection: ConnectionConfig,
        subscriptions: Vec<SubjectSubscription>,
        handler: MessageHandler,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(transport, connection, Arc::clone(&reporter)),
            subscriptions: SubscriptionSet::new(subscriptions, Arc::clone(&reporter)),
            handler: Arc::new(handler),
            reporter,
        }
    }

    /// Build from a parsed config file, decoding with its codec and applying
    /// its decoration.
    pub fn from_config(
        transport: T,
        config: &IngestConfig,
        sink: Arc<dyn OutputSink>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let handler = MessageHandler::new(
            config.codec().build(),
            Arc::new(config.decoration().clone()),
            sink,
            Arc::clone(&reporter),
        );
        Self::new(
            transport,
            config.connection().clone(),
            config.subscriptions().to_vec(),
            handler,
            reporter,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Receiver notified on every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    /// Run until `token` is cancelled or a fatal error occurs.
    ///
    /// Cancellation stops new deliveries, waits for in-flight ones and closes
    /// the connection, then returns `Ok(())`. Errors returned are fatal and
    /// have already been reported.
    pub async fn run(mut self, token: CancellationToken) -> IngestResult<()> {
        info!(
            subjects = ?self
                .subscriptions
                .subscriptions()
                .iter()
                .map(|sub| sub.subject.as_str())
                .collect::<Vec<_>>(),
            "starting NATS input"
        );

        let Some(mut established) = self.manager.connect(&token).await? else {
            info!("cancelled before connecting");
            return Ok(());
        };

        loop {
            let served = match self
                .subscriptions
                .register_all(&*established.connection, Arc::clone(&self.handler))
                .await
            {
                Ok(()) => self.serve(&mut established.events, &token).await,
                Err(err) => Served::Fatal(err),
            };

            self.subscriptions.shutdown().await;
            match served {
                Served::Shutdown => {
                    self.manager.close().await;
                    info!("NATS input stopped");
                    return Ok(());
                }
                Served::Fatal(err) => {
                    self.manager.close().await;
                    return Err(err);
                }
                Served::Disconnected(reason) => {
                    let err = IngestError::Disconnected(reason);
                    self.reporter.report(
                        &Report::new(Severity::Warning, "NATS connection lost, reconnecting")
                            .error(&err),
                    );
                    match self.manager.reconnect(&token).await? {
                        Some(next) => established = next,
                        None => {
                            info!("cancelled while reconnecting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn serve(&mut self, events: &mut TransportEvents, token: &CancellationToken) -> Served {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("shutdown requested");
                    return Served::Shutdown;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Disconnected(reason)) => {
                        return Served::Disconnected(reason);
                    }
                    Some(TransportEvent::Warning(msg)) => {
                        metrics::TRANSPORT_WARNINGS.inc();
                        self.reporter.report(
                            &Report::new(Severity::Warning, "NATS transport warning").error(&msg),
                        );
                    }
                    Some(TransportEvent::Error(msg)) => {
                        metrics::TRANSPORT_WARNINGS.inc();
                        let err = IngestError::Transport(msg);
                        self.reporter.report(
                            &Report::new(Severity::Error, "NATS transport error").error(&err),
                        );
                    }
                    None => {
                        warn!("transport event channel closed");
                        return Served::Disconnected("transport event channel closed".to_owned());
                    }
                },
                exit = self.subscriptions.next_exit() => match exit {
                    WorkerExit::Failed(err) => return Served::Fatal(err),
                    WorkerExit::StreamEnded { subject } => {
                        return Served::Disconnected(format!(
                            "subscription to '{subject}' ended"
                        ));
                    }
                    WorkerExit::Cancelled => {
                        debug!("subscription worker cancelled");
                    }
                },
            }
        }
    }
}
