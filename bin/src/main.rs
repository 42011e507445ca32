#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Result, anyhow};

mod startup_health;

use config::IngestConfig;
use external_api::{ExternalApi, Health};
use ingest_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    report::TracingReporter,
    sink::{ChannelSink, write_json_lines},
    tokio::{
        self,
        runtime::Builder,
        signal,
        sync::{mpsc, watch},
        task::JoinHandle,
    },
    tracing::*,
};
use nats_input::{ConnectionState, NatsInput, NatsTransport};
use startup_health::{verify_background_task_running, verify_startup_subsystems};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.ingest_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "failed to start nats-ingest");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(_) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing ingest config");
    let ingest_cfg = Arc::new(IngestConfig::parse(&config.config_path)?);
    info!(
        servers = ?ingest_cfg.connection().servers,
        subscriptions = ingest_cfg.subscriptions().len(),
        codec = ?ingest_cfg.codec(),
        "starting nats-ingest"
    );

    // events leave the process as json lines on stdout
    let (sink, rx) = ChannelSink::new(config.channel_size);
    let mut writer_task = tokio::spawn(async move {
        let written = write_json_lines(rx, tokio::io::stdout()).await?;
        debug!(written, "event writer finished");
        Ok::<_, anyhow::Error>(())
    });

    let input = NatsInput::from_config(
        NatsTransport::new(),
        &ingest_cfg,
        Arc::new(sink),
        Arc::new(TracingReporter),
    );
    let connection_state = input.watch_state();

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    // start external api for healthchecks
    let api = (!config.no_external_api).then(|| {
        ExternalApi::new(
            config.external_api,
            Arc::clone(&ingest_cfg),
            connection_state.clone(),
        )
    });

    let mut input_task = tokio::spawn({
        let token = token.clone();
        async move { input.run(token).await.map_err(anyhow::Error::from) }
    });

    let mut monitor = None;
    if let Some(api) = api {
        let api_sender = api.sender();
        let mut api_guard = api.start();
        // Keep health BAD until all startup-critical tasks are confirmed running.
        if let Err(err) =
            verify_startup_subsystems(&mut api_guard, &mut input_task, &mut writer_task).await
        {
            let _ = api_sender.send(Health::Bad).await;
            token.cancel();
            return Err(err);
        }
        let mut health_monitor =
            spawn_health_monitor(connection_state.clone(), api_sender, token.clone());
        if let Err(err) = verify_background_task_running("health monitor", &mut health_monitor).await
        {
            token.cancel();
            return Err(err);
        }
        monitor = Some((api_guard, health_monitor));
    }

    let input_result = flatten(input_task).await;
    token.cancel();
    // the input owned the last sink, so the writer drains and exits
    if let Err(err) = flatten(writer_task).await {
        error!(?err, "event writer failed");
    }
    if let Some((api_guard, health_monitor)) = monitor {
        api_guard.abort();
        if let Err(err) = health_monitor.await {
            error!(?err, "error waiting for health monitor task");
        }
    }
    input_result
}

/// Mirror the connection state into the api health: good only while connected.
fn spawn_health_monitor(
    mut state: watch::Receiver<ConnectionState>,
    health: mpsc::Sender<Health>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => info!("NATS connection up - health good"),
                ConnectionState::Failed => error!("NATS connection failed - health bad"),
                other => debug!(state = %other, "NATS connection not ready - health bad"),
            }
            if health.send(Health::from_connection(current)).await.is_err() {
                debug!("health receiver gone, monitor stopping");
                return;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("health monitor task stopping");
                    return;
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        debug!("connection state closed, monitor stopping");
                        return;
                    }
                }
            }
        }
    })
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
