//! homectl server - headless HTTP/WebSocket front end for the device hub.
//!
//! Runs discovery and device control without a GUI and exposes them over the
//! API in `homectl_core::api`. Sending SIGHUP reloads credentials and host
//! lists from the config file.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use homectl_core::{bind, start_server, AppState, DeviceHub, LoggingEventEmitter};
use tokio::signal;
use tokio::sync::oneshot;

use crate::config::ServerConfig;

/// homectl server - local control of smart bulbs and cast speakers.
#[derive(Parser, Debug)]
#[command(name = "homectl-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "HOMECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "HOMECTL_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "HOMECTL_BIND_PORT")]
    port: Option<u16>,

    /// Log every hub event at debug level.
    #[arg(long)]
    log_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("homectl server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    log::info!(
        "Configuration: bind_port={}, auto_discovery={}, tapo_hosts={}, tuya_devices={}",
        config.bind_port,
        config.auto_discovery,
        config.tapo.hosts.len(),
        config.tuya.len()
    );

    let hub = Arc::new(
        DeviceHub::start(&config.to_core_config()).context("Failed to start device hub")?,
    );
    if args.log_events {
        hub.set_external_emitter(Arc::new(LoggingEventEmitter));
    }
    log::info!("Device hub started");

    let (port, listener) = bind(config.bind_port)
        .await
        .context("Failed to bind HTTP port")?;
    let app_state = AppState::builder()
        .hub(Arc::clone(&hub))
        .trusted_origins(config.trusted_origins.clone())
        .build();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_handle = tokio::spawn(start_server(app_state, listener, async move {
        let _ = stop_rx.await;
    }));
    log::info!("HTTP server started on port {}", port);

    run_until_shutdown(&hub, args.config.as_deref()).await?;

    log::info!("Shutdown signal received, cleaning up...");
    let _ = stop_tx.send(());
    hub.shutdown();

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Server error: {}", e),
        Err(e) => log::error!("Server task failed: {}", e),
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Serves reload requests until a shutdown signal arrives.
async fn run_until_shutdown(hub: &DeviceHub, config_path: Option<&Path>) -> Result<()> {
    let mut reload = ReloadSignal::install()?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = reload.recv() => reload_config(hub, config_path),
        }
    }
}

/// Re-reads the config file and hands credentials to the hub.
///
/// Failures are logged; the hub keeps its previous configuration.
fn reload_config(hub: &DeviceHub, config_path: Option<&Path>) {
    let Some(path) = config_path else {
        log::warn!("Reload requested but no config file was given");
        return;
    };
    let result = ServerConfig::load(Some(path))
        .and_then(|config| Ok(hub.reload_config(&config.to_core_config())?));
    match result {
        Ok(unblocked) => log::info!(
            "Reloaded {} ({} device(s) unblocked)",
            path.display(),
            unblocked
        ),
        Err(e) => log::error!("Reload of {} failed: {:#}", path.display(), e),
    }
}

/// SIGHUP on unix; never fires elsewhere.
struct ReloadSignal {
    #[cfg(unix)]
    hangup: signal::unix::Signal,
}

impl ReloadSignal {
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            hangup: signal::unix::signal(signal::unix::SignalKind::hangup())
                .context("Failed to install SIGHUP handler")?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if self.hangup.recv().await.is_some() {
            return;
        }
        std::future::pending::<()>().await
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
