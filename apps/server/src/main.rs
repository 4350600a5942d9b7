//! AirPlay Server - headless daemon supervising AirPlay speaker sessions.
//!
//! Discovers speakers over mDNS, keeps one protocol session per speaker
//! alive and serves the HTTP control API until it receives a shutdown signal.

mod config;

use std::path::PathBuf;

use airplay_core::{bootstrap_services, start_server, AppState, BootstrapOptions};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Headless AirPlay speaker session supervisor.
#[derive(Parser, Debug)]
#[command(name = "airplay-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Minimum log level: error, warn, info, debug or trace.
    #[arg(short, long, default_value = "info", env = "AIRPLAY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// HTTP port; wins over the configuration file.
    #[arg(short = 'p', long, env = "AIRPLAY_BIND_PORT")]
    port: Option<u16>,

    /// Where pairing credentials are persisted.
    #[arg(short = 'd', long, env = "AIRPLAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Explicit cliairplay binary, skipping the per-platform lookup.
    #[arg(short = 'b', long, env = "AIRPLAY_BINARY")]
    binary: Option<PathBuf>,
}

impl Args {
    /// Loads the configuration file and lays command-line values over it.
    fn resolve_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;
        config.bind_port = self.port.unwrap_or(config.bind_port);
        if self.data_dir.is_some() {
            config.data_dir.clone_from(&self.data_dir);
        }
        if self.binary.is_some() {
            config.binary.clone_from(&self.binary);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("airplay-server {} starting", env!("CARGO_PKG_VERSION"));

    let config = args.resolve_config()?;
    let engine_config = config.to_core_config();
    log::info!(
        "Port {}, polling every {}s, mDNS {}",
        config.bind_port,
        engine_config.poll_interval_secs,
        if engine_config.discovery_mdns { "on" } else { "off" }
    );

    let options = BootstrapOptions {
        backend: config.to_backend_config(),
        group_leader: config
            .to_leader_config()
            .context("Invalid group leader configuration")?,
        data_dir: config.data_dir.clone(),
    };
    let services =
        bootstrap_services(&engine_config, options).context("Failed to bootstrap services")?;
    services.start_background_tasks();
    log::info!("Engine running");

    let http_cancel = CancellationToken::new();
    let http = tokio::spawn({
        let state = AppState::new(&services);
        let port = config.bind_port;
        let cancel = http_cancel.clone();
        async move {
            if let Err(e) = start_server(state, port, cancel).await {
                log::error!("HTTP server stopped: {}", e);
            }
        }
    });

    wait_for_termination().await;
    log::info!("Stopping: closing the API, then releasing every speaker session");

    http_cancel.cancel();
    services.shutdown().await;
    if let Err(e) = http.await {
        log::warn!("HTTP task ended abnormally: {}", e);
    }

    log::info!("Stopped");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
///
/// A handler that cannot be installed never resolves, so the other one
/// still works.
async fn wait_for_termination() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {},
        () = sigterm => {},
    }
}
