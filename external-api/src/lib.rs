//! # Health & metrics API
//!
//! HTTP endpoints for a running nats-ingest:
//!
//! - `/health`: 200 while health is good, 500 otherwise
//! - `/ping`
//! - `/status`: JSON snapshot of the connection and the subscriptions
//! - `/metrics`, `/metrics-text`: prometheus, protobuf or text encoded
//! - `/config`: the config file as loaded
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Result, bail};
use axum::{Router, routing};

use config::IngestConfig;
use nats_input::ConnectionState;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error};

pub use crate::models::{Health, SharedHealth};

/// Everything a request handler can see.
#[derive(Debug, Clone)]
struct ApiContext {
    health: SharedHealth,
    connection: watch::Receiver<ConnectionState>,
    cfg: Arc<IngestConfig>,
}

/// Serves the endpoints and tracks the health pushed through
/// [`sender`](Self::sender). Health starts out bad.
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    ctx: ApiContext,
}

impl ExternalApi {
    /// Create the api for `addr`. Nothing is bound until [`start`](Self::start).
    pub fn new(
        addr: SocketAddr,
        cfg: Arc<IngestConfig>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10);
        Self {
            tx,
            rx,
            addr,
            ctx: ApiContext {
                health: models::bad_health(),
                connection,
                cfg,
            },
        }
    }

    /// Channel for health updates.
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Bind and serve in a new task, applying health updates as they arrive.
    pub fn start(self) -> JoinHandle<()> {
        let Self { tx, mut rx, addr, ctx } = self;
        let health = Arc::clone(&ctx.health);
        tokio::spawn(async move {
            // held so updates never end while the api runs
            let _tx = tx;
            let updates = async move {
                while let Some(next) = rx.recv().await {
                    let prev = std::mem::replace(&mut *health.lock(), next);
                    if prev != next {
                        debug!(?prev, ?next, "health changed");
                    }
                }
                Ok::<_, anyhow::Error>(())
            };
            if let Err(err) = tokio::try_join!(serve(addr, ctx), updates) {
                error!(?err, "external API stopped");
            }
        })
    }
}

async fn serve(addr: SocketAddr, ctx: ApiContext) -> Result<()> {
    let tcp = TcpListener::bind(&addr).await?;
    let app = Router::new()
        .route("/health", routing::get(handlers::health))
        .route("/ping", routing::get(handlers::ping))
        .route("/status", routing::get(handlers::status))
        .route("/metrics", routing::get(handlers::metrics))
        .route("/metrics-text", routing::get(handlers::metrics_text))
        .route("/config", routing::get(handlers::config))
        .with_state(ctx);

    debug!(%addr, "external API listening");
    axum::serve(tcp, app).await?;
    bail!("external API returned-- should not happen")
}

mod handlers {
    use anyhow::Context;
    use axum::{
        Json,
        body::Body,
        extract::State,
        http::{Response, StatusCode, header},
        response::IntoResponse,
    };
    use ingest_core::metrics::{START_TIME, UPTIME};
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::{error, trace};

    use super::ApiContext;
    use crate::models::{Health, ServerResult, Status, SubscriptionStatus};

    pub(crate) async fn health(State(ctx): State<ApiContext>) -> StatusCode {
        match *ctx.health.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) async fn ping() -> StatusCode {
        StatusCode::OK
    }

    pub(crate) async fn status(State(ctx): State<ApiContext>) -> Json<Status> {
        let health = *ctx.health.lock();
        let connection = ctx.connection.borrow().to_string();
        let cfg = &ctx.cfg;
        Json(Status {
            health,
            connection,
            servers: cfg.connection().servers.clone(),
            codec: cfg.codec(),
            subscriptions: cfg
                .subscriptions()
                .iter()
                .map(|sub| SubscriptionStatus {
                    subject: sub.subject.clone(),
                    queue_group: sub.queue_group.clone(),
                })
                .collect(),
            uptime_secs: START_TIME.elapsed().as_secs(),
        })
    }

    pub(crate) async fn config(State(ctx): State<ApiContext>) -> ServerResult<impl IntoResponse> {
        let path = ctx.cfg.path().context("config was not loaded from a file")?;
        trace!(path = %path.display(), "serving config");
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Ok(raw)
    }

    pub(crate) async fn metrics() -> ServerResult<Response<Body>> {
        encode_metrics(&ProtobufEncoder::new())
    }

    pub(crate) async fn metrics_text() -> ServerResult<Response<Body>> {
        encode_metrics(&TextEncoder::new())
    }

    fn encode_metrics<E: Encoder>(encoder: &E) -> ServerResult<Response<Body>> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let mut buf = Vec::new();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());
        match encoder.encode(&prometheus::gather(), &mut buf) {
            Ok(()) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
            Err(err) => {
                error!(?err, format = encoder.format_type(), "error encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
        }
    }
}

/// Response models
pub mod models {
    use axum::response::IntoResponse;
    use ingest_core::codec::CodecKind;
    use nats_input::ConnectionState;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    /// Health shared between the update task and the handlers
    pub type SharedHealth = Arc<Mutex<Health>>;

    /// Binary health of the bridge
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// connected and ingesting
        Good,
        /// anything else
        Bad,
    }

    impl Health {
        /// Good only while connected to the broker
        pub fn from_connection(state: ConnectionState) -> Self {
            match state {
                ConnectionState::Connected => Health::Good,
                _ => Health::Bad,
            }
        }
    }

    pub(crate) fn bad_health() -> SharedHealth {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// `/status` response
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Status {
        /// overall health
        pub health: Health,
        /// broker connection state
        pub connection: String,
        /// configured servers
        pub servers: Vec<String>,
        /// payload codec
        pub codec: CodecKind,
        /// configured subscriptions, in order
        pub subscriptions: Vec<SubscriptionStatus>,
        /// seconds since start
        pub uptime_secs: u64,
    }

    /// one configured subscription
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct SubscriptionStatus {
        /// subject, possibly with wildcards
        pub subject: String,
        /// queue group, if any
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pub queue_group: Option<String>,
    }

    /// Handler error, rendered as a 500 with the error chain as body.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// handler result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{:#}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
