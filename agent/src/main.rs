use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use log::info;
use std::sync::Arc;

mod diff;
mod hub;
mod ipc;
mod monitor;
mod producer;
mod scheduler;

use hub::SubscriberHub;
use ipc::start_ipc_server;
use monitor::Monitor;
use producer::ProducerRegistry;
use scheduler::ScanSettings;
use common::Config;

#[derive(Parser, Debug)]
#[command(name = "driftwatch-agent", about = "Continuous cloud configuration drift monitor")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "DRIFTWATCH_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting driftwatch agent");

    // Load configuration
    let config_path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    info!("Config loaded from {}", config_path);

    // Unknown services fail here, before anything is spawned
    let backend = producer::from_config(&config.producer)?;
    let producers = ProducerRegistry::for_services(&config.agent.services, backend)
        .context("invalid [agent] services")?;
    info!("Monitoring services: {}", producers.services().join(", "));

    let settings = ScanSettings::from(&config.agent);
    info!(
        "Scan interval {}s, error backoff {}s",
        settings.scan_interval.as_secs(),
        settings.error_backoff.as_secs()
    );
    let hub = SubscriberHub::with_capacity(config.agent.subscriber_queue);
    let monitor = Arc::new(Monitor::new(producers, settings, hub));

    // Start IPC server
    start_ipc_server(
        monitor.clone(),
        config.ipc.socket_path.clone(),
        config.agent.start_on_subscribe,
    )
    .await?;
    info!("IPC server started on {}", config.ipc.socket_path);

    if config.agent.autostart {
        monitor.start().await;
    }

    info!("driftwatch agent is running");

    // Wait for ctrl-c
    signal::ctrl_c().await?;
    info!("Shutting down");
    monitor.stop().await;
    let _ = std::fs::remove_file(&config.ipc.socket_path);
    Ok(())
}
