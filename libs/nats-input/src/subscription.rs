//! Subscription registration and the per-subscription delivery workers.

use std::sync::Arc;

use futures::StreamExt;
use ingest_core::{ErrorReporter, Report, Severity, metrics};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use config::SubjectSubscription;

use crate::{
    error::{IngestError, IngestResult},
    handler::MessageHandler,
    transport::{Connection, Deliveries},
};

/// Why a delivery worker stopped.
#[derive(Debug)]
pub enum WorkerExit {
    /// Stopped by [`SubscriptionSet::shutdown`].
    Cancelled,
    /// The transport ended the delivery stream, usually because the
    /// connection went away.
    StreamEnded { subject: String },
    /// Handling a delivery failed in a way that stops ingestion.
    Failed(IngestError),
}

/// The configured subscriptions and the workers serving them on the current
/// connection.
#[derive(Debug)]
pub struct SubscriptionSet {
    subscriptions: Vec<SubjectSubscription>,
    workers: JoinSet<WorkerExit>,
    token: CancellationToken,
    reporter: Arc<dyn ErrorReporter>,
}

impl SubscriptionSet {
    pub fn new(subscriptions: Vec<SubjectSubscription>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            subscriptions,
            workers: JoinSet::new(),
            token: CancellationToken::new(),
            reporter,
        }
    }

    pub fn subscriptions(&self) -> &[SubjectSubscription] {
        &self.subscriptions
    }

    /// Number of running workers.
    pub fn active(&self) -> usize {
        self.workers.len()
    }

    /// Subscribe every configured subject on `connection`, in order, then
    /// start one worker per subscription.
    ///
    /// Previous workers are stopped first. If any subscribe call fails no
    /// worker is started and the subscriptions made so far are released.
    pub async fn register_all<C>(
        &mut self,
        connection: &C,
        handler: Arc<MessageHandler>,
    ) -> IngestResult<()>
    where
        C: Connection + ?Sized,
    {
        self.shutdown().await;

        let mut streams: Vec<(SubjectSubscription, Deliveries)> =
            Vec::with_capacity(self.subscriptions.len());
        for sub in &self.subscriptions {
            debug!(subject = %sub.subject, queue_group = ?sub.queue_group, "subscribing");
            match connection
                .subscribe(&sub.subject, sub.queue_group.as_deref())
                .await
            {
                Ok(deliveries) => streams.push((sub.clone(), deliveries)),
                Err(err) => {
                    let err = IngestError::Subscribe {
                        subject: sub.subject.clone(),
                        reason: err.to_string(),
                    };
                    self.reporter.report(
                        &Report::new(Severity::Fatal, "subscription rejected")
                            .subject(sub.subject.as_str())
                            .error(&err),
                    );
                    return Err(err);
                }
            }
        }

        self.token = CancellationToken::new();
        for (sub, deliveries) in streams {
            self.workers.spawn(run_worker(
                sub,
                deliveries,
                Arc::clone(&handler),
                self.token.clone(),
            ));
        }
        metrics::ACTIVE_SUBSCRIPTIONS.set(self.workers.len() as i64);
        info!(count = self.workers.len(), "subscriptions registered");
        Ok(())
    }

    /// Stop every worker, letting in-flight handler calls finish, and drop
    /// the subscription handles.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                error!(error = %err, "subscription worker panicked");
            }
        }
        metrics::ACTIVE_SUBSCRIPTIONS.set(0);
    }

    /// Resolves when a worker stops on its own. Pending forever when no
    /// worker runs.
    pub async fn next_exit(&mut self) -> WorkerExit {
        match self.workers.join_next().await {
            Some(Ok(exit)) => {
                metrics::ACTIVE_SUBSCRIPTIONS.set(self.workers.len() as i64);
                exit
            }
            Some(Err(err)) => WorkerExit::Failed(IngestError::Transport(format!(
                "subscription worker failed: {err}"
            ))),
            None => std::future::pending().await,
        }
    }
}

async fn run_worker(
    sub: SubjectSubscription,
    mut deliveries: Deliveries,
    handler: Arc<MessageHandler>,
    token: CancellationToken,
) -> WorkerExit {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = token.cancelled() => return WorkerExit::Cancelled,
            delivery = deliveries.next() => delivery,
        };
        let Some(delivery) = delivery else {
            debug!(subject = %sub.subject, "delivery stream ended");
            return WorkerExit::StreamEnded {
                subject: sub.subject,
            };
        };
        // runs to completion even if cancelled meanwhile
        if let Err(err) = handler.handle(&sub, delivery).await {
            return WorkerExit::Failed(err);
        }
    }
}
