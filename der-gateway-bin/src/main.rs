use anyhow::Context;
use clap::Parser;
use der_driver_modbus::{ModbusDataSource, ModbusNetwork};
use der_gateway_common::{Logger, Settings, SourceSettings};
use der_plugin_modbus_server::ModbusServer;
use std::{
    env::{current_dir, set_current_dir},
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

const DEFAULT_CONFIG_FILE_NAME: &str = "der-gateway.toml";

/// DER gateway
///
/// Polls southward Modbus devices and serves register banks to Modbus TCP masters.
#[derive(Parser)]
#[command(name = "der-gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "DER gateway", long_about = None)]
struct Cli {
    /// Sets a custom config file with full path
    ///
    /// If not specified, the gateway will look for 'der-gateway.toml'
    /// in the current working directory.
    #[arg(short, long, env = "DER_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<Level>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => current_dir()
            .context("Failed to get current directory")?
            .join(DEFAULT_CONFIG_FILE_NAME),
    };
    let settings = Settings::new(&config_path.to_string_lossy())?;
    set_current_dir(&settings.general.runtime_dir).with_context(|| {
        format!(
            "Failed to enter runtime directory {}",
            settings.general.runtime_dir
        )
    })?;

    let mut logger = Logger::new(&settings.log);
    if let Some(level) = cli.log_level {
        logger.set_level(level);
    }
    logger.initialize()?;
    info!(config = %config_path.display(), "Starting DER gateway");

    let cancel = CancellationToken::new();

    let mut pollers = Vec::with_capacity(settings.sources.len());
    for source in &settings.sources {
        let network = Arc::new(ModbusNetwork::new(source.network.clone()));
        let data_source = ModbusDataSource::new(source.source.clone(), network)
            .with_context(|| format!("Invalid Modbus source {}", source.name))?;
        // the blocking Modbus client runs its own runtime, so pollers stay off tokio threads
        let handle = thread::Builder::new()
            .name(format!("poll-{}", source.name))
            .spawn({
                let source = source.clone();
                let cancel = cancel.clone();
                move || poll_source(&source, &data_source, &cancel)
            })
            .with_context(|| format!("Failed to start poller for {}", source.name))?;
        pollers.push(handle);
    }

    let server_task = match settings.modbus_server.clone() {
        Some(config) => {
            let server = ModbusServer::new(config).context("Invalid Modbus server settings")?;
            let cancel = cancel.clone();
            Some(tokio::spawn(async move { server.serve(cancel).await }))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    cancel.cancel();

    if let Some(task) = server_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Modbus server failed"),
            Err(e) => error!(error = %e, "Modbus server task panicked"),
        }
    }
    tokio::task::spawn_blocking(move || {
        for handle in pollers {
            if handle.join().is_err() {
                error!("Modbus poller panicked");
            }
        }
    })
    .await?;

    info!("DER gateway stopped");
    Ok(())
}

fn poll_source(settings: &SourceSettings, source: &ModbusDataSource, cancel: &CancellationToken) {
    info!(source = %settings.name, interval_ms = settings.poll_interval_ms, "Polling Modbus source");
    while !cancel.is_cancelled() {
        match source.read_sample() {
            Ok(sample) => {
                let values = sample
                    .values
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(source = %settings.name, timestamp = %sample.timestamp, "Sample {{{values}}}");
            }
            Err(e) => error!(source = %settings.name, error = %e, "Modbus sample failed"),
        }

        let deadline = Instant::now() + settings.poll_interval();
        while !cancel.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(Duration::from_millis(100)));
        }
    }
}
