use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use ingest_core::tokio::{self, task::JoinHandle};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    input_task: &mut JoinHandle<Result<(), anyhow::Error>>,
    writer_task: &mut JoinHandle<Result<(), anyhow::Error>>,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .context("startup check failed")?;
    verify_task_running("nats input", input_task)
        .await
        .context("startup check failed")?;
    verify_task_running("event writer", writer_task)
        .await
        .context("startup check failed")?;
    Ok(())
}

pub async fn verify_task_running(
    name: &str,
    task: &mut JoinHandle<Result<(), anyhow::Error>>,
) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(Ok(())) => Err(anyhow!("{name} exited during startup stabilization window")),
            Ok(Err(err)) => Err(anyhow!("{name} failed during startup: {err}")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}
