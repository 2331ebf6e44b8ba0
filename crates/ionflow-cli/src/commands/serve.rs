//! Serve command implementation.
//!
//! Runs the pipeline against a simulated lab until SIGINT or SIGTERM.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::style;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use ionflow_adapter_sim::{
    InMemoryParameterSource, SimDeviceBank, SimulatedHardware, TemplateSequenceGenerator,
};
use ionflow_sched::{Collaborators, EventBus, JsonlResultStore, Pipeline, RunEvent};

use super::common::{LabFile, load_config, open_store, styled_run_status};

/// Execute the serve command.
pub async fn execute(config_path: Option<&Path>, lab_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let lab = match lab_path {
        Some(path) => LabFile::load(path)?,
        None => LabFile::default(),
    };

    println!(
        "{} Serving from {} ({} device(s))",
        style("→").cyan().bold(),
        style(config.state_dir.display()).green(),
        lab.devices.len()
    );

    let store = open_store(&config)?;
    let results = JsonlResultStore::new(config.results_dir())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open result directory: {e}"))?;
    let collaborators = simulated_lab(lab, results);

    let pipeline = Pipeline::start(config, store, collaborators, EventBus::new())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start pipeline: {e}"))?;

    let shutdown = pipeline.shutdown_token();
    install_shutdown_handler(shutdown.clone())?;

    let mut events = pipeline.subscribe();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} run events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("{} Shutting down", style("→").cyan().bold());
    pipeline
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Pipeline stopped with error: {e}"))?;
    println!("{} Stopped", style("✓").green().bold());
    Ok(())
}

/// Build simulated collaborators from a lab description.
fn simulated_lab(lab: LabFile, results: JsonlResultStore) -> Collaborators {
    let parameters = InMemoryParameterSource::new();
    for (key, value) in lab.globals {
        parameters.set_global(key, value);
    }
    for (namespace, values) in lab.locals {
        for (key, value) in values {
            parameters.set_local(namespace.clone(), key, value);
        }
    }

    let devices = lab
        .devices
        .into_iter()
        .fold(SimDeviceBank::new(), SimDeviceBank::with_device);
    let devices = Arc::new(devices);

    let mut hardware = SimulatedHardware::new();
    if !lab.channels.is_empty() {
        hardware = hardware.with_channels(lab.channels);
    }
    if lab.execution_ms > 0 {
        hardware = hardware.with_delay(Duration::from_millis(lab.execution_ms));
    }

    Collaborators {
        parameters: Arc::new(parameters),
        generator: Arc::new(TemplateSequenceGenerator::new()),
        registry: devices.clone(),
        devices,
        hardware: Arc::new(hardware),
        results: Arc::new(results),
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
fn install_shutdown_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {e}"))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {e}"))?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            () = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunCreated { run } => println!(
            "  {} run {} for job {} at {}",
            style("+").cyan(),
            style(run.id).dim(),
            run.job_id,
            run.scheduled_time.format("%H:%M:%S%.3f")
        ),
        RunEvent::RunUpdated {
            run_id,
            status,
            log,
        } => println!(
            "  {} run {} {}{}",
            style("•").cyan(),
            style(run_id).dim(),
            styled_run_status(*status),
            log.as_deref().map(|l| format!(": {l}")).unwrap_or_default()
        ),
    }
}
