//! # ingest-core
//!
//! Shared pieces of nats-ingest: the event model, the codec, sink and
//! reporting traits the subscription loop is written against, decoration,
//! process configuration and metrics.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use bytes;
pub use chrono;
pub use serde_json;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub use crate::{
    codec::Decoder,
    decorate::{Decoration, Decorator},
    event::Event,
    report::{ErrorReporter, Report, Severity},
    sink::OutputSink,
};

pub mod codec;
pub mod config;
pub mod decorate;
pub mod env;
pub mod event;
pub mod metrics;
pub mod report;
pub mod sink;
