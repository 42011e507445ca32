//! Per-delivery processing: decode, decorate, tag with the subject and
//! hand off to the sink.

use std::{fmt, sync::Arc};

use ingest_core::{
    Decoder, Decorator, ErrorReporter, OutputSink, Report, Severity, event::NATS_SUBJECT, metrics,
};
use tracing::{instrument, trace};

use config::SubjectSubscription;

use crate::{
    error::{IngestError, IngestResult},
    transport::Delivery,
};

/// Turns deliveries into events. Shared by every subscription worker.
pub struct MessageHandler {
    decoder: Arc<dyn Decoder>,
    decorator: Arc<dyn Decorator>,
    sink: Arc<dyn OutputSink>,
    reporter: Arc<dyn ErrorReporter>,
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("codec", &self.decoder.name())
            .field("decorator", &self.decorator)
            .field("sink", &self.sink)
            .finish()
    }
}

impl MessageHandler {
    pub fn new(
        decoder: Arc<dyn Decoder>,
        decorator: Arc<dyn Decorator>,
        sink: Arc<dyn OutputSink>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            decoder,
            decorator,
            sink,
            reporter,
        }
    }

    /// Process one delivery received on `subscription`, returning how many
    /// events were appended.
    ///
    /// A payload that fails to decode is reported and dropped (`Ok(0)`). The
    /// only error is a sink that no longer accepts events.
    #[instrument(level = "trace", skip_all, fields(subject = %delivery.subject))]
    pub async fn handle(
        &self,
        subscription: &SubjectSubscription,
        delivery: Delivery,
    ) -> IngestResult<usize> {
        let Delivery {
            subject,
            payload,
            reply,
        } = delivery;
        metrics::MESSAGES_RECEIVED
            .with_label_values(&[subscription.subject.as_str()])
            .inc();
        metrics::BYTES_RECEIVED.inc_by(payload.len() as u64);
        trace!(bytes = payload.len(), ?reply, "message received");

        let events = match self.decoder.decode(payload) {
            Ok(events) => events,
            Err(err) => {
                metrics::DECODE_FAILURES
                    .with_label_values(&[subscription.subject.as_str()])
                    .inc();
                let err = IngestError::Decode {
                    subject: subject.clone(),
                    reason: err.to_string(),
                };
                self.reporter.report(
                    &Report::new(
                        Severity::Error,
                        format!("dropping message, {} codec failed", self.decoder.name()),
                    )
                    .subject(subject)
                    .error(&err),
                );
                return Ok(0);
            }
        };

        let mut appended = 0;
        for mut event in events {
            self.decorator.decorate(&mut event);
            event.set(NATS_SUBJECT, subject.as_str());
            if let Err(err) = self.sink.append(event).await {
                let err = IngestError::Sink(err.to_string());
                self.reporter.report(
                    &Report::new(Severity::Fatal, "pipeline stopped accepting events")
                        .subject(subject.as_str())
                        .error(&err),
                );
                return Err(err);
            }
            appended += 1;
        }
        trace!(appended, "message handled");
        Ok(appended)
    }
}
