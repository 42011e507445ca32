//! # Error reporting
//!
//! Per-message and per-connection problems are surfaced through an
//! [`ErrorReporter`] instead of being returned, so a bad payload or a broker
//! warning never stops ingestion.
use std::fmt;

use tracing::{debug, error, info, warn};

/// How bad a [`Report`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// informational, e.g. connection restored
    Info,
    /// recoverable, e.g. slow consumer or a dropped connection
    Warning,
    /// one message or operation failed
    Error,
    /// ingestion cannot continue
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        })
    }
}

/// A human readable problem record with enough context to diagnose it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// severity
    pub severity: Severity,
    /// what happened
    pub message: String,
    /// subject involved, if any
    pub subject: Option<String>,
    /// underlying error text, if any
    pub error: Option<String>,
}

impl Report {
    /// new report without context
    pub fn new<S: Into<String>>(severity: Severity, message: S) -> Self {
        Self {
            severity,
            message: message.into(),
            subject: None,
            error: None,
        }
    }

    /// attach the subject
    pub fn subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// attach the error text
    pub fn error<E: fmt::Display + ?Sized>(mut self, err: &E) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some(subject) = &self.subject {
            write!(f, " (subject: {subject})")?;
        }
        if let Some(err) = &self.error {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

/// Receives error and warning records. Must not panic; a reporting failure
/// can't be allowed to take ingestion down with it.
pub trait ErrorReporter: Send + Sync + fmt::Debug + 'static {
    /// record `report`
    fn report(&self, report: &Report);
}

/// Reports as structured `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: &Report) {
        let subject = report.subject.as_deref().unwrap_or("");
        let err = report.error.as_deref().unwrap_or("");
        match report.severity {
            Severity::Info => info!(subject, err, "{}", report.message),
            Severity::Warning => warn!(subject, err, "{}", report.message),
            Severity::Error => error!(subject, err, "{}", report.message),
            Severity::Fatal => error!(subject, err, fatal = true, "{}", report.message),
        }
    }
}

/// Drops everything, logging at debug only
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, report: &Report) {
        debug!(%report, "report dropped");
    }
}
