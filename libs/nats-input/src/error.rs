//! Error types for the NATS input.
//!
//! Per-message problems (bad payloads) never surface here as returned
//! errors, they go to the [`ErrorReporter`](ingest_core::ErrorReporter).
//! What does come back from the run loop is terminal.

use thiserror::Error;

/// Top-level error type for the nats-input crate.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A single connection attempt failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// An established connection dropped.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// The reconnect policy ran out of attempts.
    #[error("connection attempts exhausted after {attempts} attempt(s): {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// The broker rejected a subscription.
    #[error("failed to subscribe to '{subject}': {reason}")]
    Subscribe { subject: String, reason: String },

    /// A payload couldn't be decoded. The message is dropped.
    #[error("failed to decode message on '{subject}': {reason}")]
    Decode { subject: String, reason: String },

    /// The downstream pipeline stopped accepting events.
    #[error("pipeline error: {0}")]
    Sink(String),

    /// Transport-level failure outside of connect/subscribe.
    #[error("transport error: {0}")]
    Transport(String),
}

impl IngestError {
    /// Returns true if the condition may clear on its own and the connection
    /// manager should keep trying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Connect(_) | IngestError::Disconnected(_))
    }

    /// Returns true if ingestion can't continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::ReconnectExhausted { .. }
                | IngestError::Subscribe { .. }
                | IngestError::Sink(_)
                | IngestError::Transport(_)
        )
    }
}

/// Shorthand result alias for ingest operations.
pub type IngestResult<T> = Result<T, IngestError>;
