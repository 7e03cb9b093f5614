//! # dmg-host
//!
//! Emulator host binary: loads settings, installs logging and metrics, and
//! serves one emulator per WebSocket connection until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dmg_core::logging::{LogFormat, init_subscriber};
use dmg_machine::{MachineConfig, MachineFactory};
use dmg_server::config::ServerConfig;
use dmg_server::server::DmgServer;
use dmg_settings::HostSettings;
use tracing::info;

/// Game Boy emulator host.
#[derive(Parser, Debug)]
#[command(name = "dmg-host", about = "Serve emulator sessions over WebSocket")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// WebSocket route (overrides settings).
    #[arg(long)]
    route: Option<String>,

    /// Settings file (default `~/.dmg-host/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory named ROMs are loaded from (overrides settings).
    #[arg(long)]
    rom_dir: Option<String>,

    /// Log filter directive (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: `compact` or `json` (overrides settings).
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut HostSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(route) = &self.route {
            settings.server.route.clone_from(route);
        }
        if let Some(dir) = &self.rom_dir {
            settings.emulator.rom_dir.clone_from(dir);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn build_server(settings: &HostSettings) -> DmgServer {
    let factory = MachineFactory::new(MachineConfig::from(&settings.emulator));
    DmgServer::new(ServerConfig::from(&settings.server), Arc::new(factory))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(dmg_settings::settings_path);
    let mut settings = dmg_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_subscriber(&settings.logging.level, settings.logging.format);
    let metrics_handle = dmg_server::metrics::install_recorder();

    let server = build_server(&settings).with_metrics(metrics_handle);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    info!(
        rom_dir = %settings.emulator.rom_dir,
        default_rom = settings.emulator.default_rom.as_deref().unwrap_or("none"),
        "dmg host listening on ws://{addr}{}",
        server.config().route
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    server.shutdown().graceful_shutdown(None).await;
    let _ = handle.await;

    info!("Shutdown complete");
    Ok(())
}
