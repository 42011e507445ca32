//! # Sinks
//!
//! Where finished events go. [`OutputSink::append`] may wait, that is how the
//! pipeline pushes back on the subscription workers.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, trace};

use crate::{event::Event, metrics};

/// Sink failure
#[derive(Debug, Error)]
pub enum SinkError {
    /// the receiving side is gone, nothing more can be appended
    #[error("sink closed")]
    Closed,
    /// event could not be serialized
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// output could not be written
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts completed events, one at a time
#[async_trait]
pub trait OutputSink: Send + Sync + fmt::Debug + 'static {
    /// append an event, waiting if the pipeline is full
    async fn append(&self, event: Event) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: OutputSink + ?Sized> OutputSink for Arc<S> {
    async fn append(&self, event: Event) -> Result<(), SinkError> {
        (**self).append(event).await
    }
}

/// Bounded channel into the pipeline. `append` waits while the channel is
/// full and fails once the receiver is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    /// new sink plus the receiving half for the pipeline
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn append(&self, event: Event) -> Result<(), SinkError> {
        self.tx.send(event).await.map_err(|_| SinkError::Closed)?;
        metrics::EVENTS_EMITTED.inc();
        Ok(())
    }
}

/// Drains `rx` into `writer` as newline delimited json until every sender is
/// dropped. Used by the binary to hand events to stdout.
pub async fn write_json_lines<W>(mut rx: mpsc::Receiver<Event>, mut writer: W) -> Result<u64, SinkError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut written = 0;
    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        written += 1;
        trace!(written, "event written");
    }
    writer.flush().await?;
    debug!(written, "event writer finished, all senders dropped");
    Ok(written)
}
