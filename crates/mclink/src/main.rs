//! # MCLink
//!
//! Runs a Bedrock dedicated server and links it to its world script and to
//! websocket clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration (creates config.toml on first run)
//! cargo run -p mclink
//!
//! # Use a different server directory and keep the server offline
//! cargo run -p mclink -- --directory /srv/bds --no-autostart
//! ```
//!
//! While running, type `start`, `stop`, `restart`, `status` or `players`;
//! any other line is sent to the server console.

use link_server::{Bridge, Platform, Status};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod cli;
mod config;
mod console;
mod logging;
mod signals;

use cli::CliArgs;
use config::AppConfig;
use logging::setup_logging;
use signals::wait_for_shutdown_signal;

/// Extra time granted on top of the supervisor's own stop escalation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Application {
    config: AppConfig,
    bridge: Arc<Bridge>,
    stop_timeout: Duration,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(directory) = args.directory {
            config.server.directory = directory.to_string_lossy().to_string();
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        if args.no_autostart {
            config.server.auto_start = false;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {}", e).into());
        }

        setup_logging(&config.logging, args.json_logs)?;
        display_banner();

        let bridge_config = config.to_bridge_config()?;
        check_installed_platform(bridge_config.platform, &bridge_config.server_dir);

        info!(
            "📂 Config: {} | Server: {} ({})",
            args.config_path.display(),
            config.server.directory,
            bridge_config.platform
        );

        let stop_timeout = bridge_config.stop_timeout;
        let bridge = Arc::new(Bridge::new(bridge_config));

        Ok(Self {
            config,
            bridge,
            stop_timeout,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("📋 Configuration Summary:");
        info!("  🔌 Socket mode: {}", self.config.socket.mode);
        if self.config.socket.mode != "disabled" {
            info!("  🌐 Socket: {}:{}", self.config.socket.host, self.config.socket.port);
        }
        info!("  ⏱️ Stop timeout: {}s", self.config.server.stop_timeout_secs);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let bridge_handle = {
            let bridge = self.bridge.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.run(shutdown_rx).await {
                    error!("❌ Bridge error: {}", e);
                }
            })
        };

        // Let the bridge subscribe before the first records arrive.
        tokio::task::yield_now().await;

        let supervisor = self.bridge.supervisor().clone();
        if self.config.server.auto_start {
            if let Err(e) = supervisor.start().await {
                error!("❌ Failed to start server: {}", e);
            }
        } else {
            info!("⏸️ Auto start disabled; type `start` to launch the server");
        }

        let console_handle = tokio::spawn(console::run_console(
            BufReader::new(tokio::io::stdin()),
            supervisor.clone(),
        ));

        info!("✅ MCLink is running");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let signal = wait_for_shutdown_signal().await?;

        info!("🛑 Received {}, stopping server...", signal);
        console_handle.abort();

        if supervisor.stop().await {
            let settled = tokio::time::timeout(
                self.stop_timeout + SHUTDOWN_GRACE,
                supervisor.wait_for(Status::Offline),
            )
            .await;
            if settled.is_err() {
                warn!("Server did not stop in time, forcing");
                supervisor.force_stop().await;
            }
        }

        let _ = shutdown_tx.send(());
        if let Err(e) = bridge_handle.await {
            warn!("Bridge task ended abnormally: {}", e);
        }

        info!("👋 MCLink shutdown complete");
        Ok(())
    }
}

/// Warns when the server directory holds a different build than configured.
fn check_installed_platform(configured: Platform, dir: &Path) {
    match Platform::detect(dir) {
        Some(installed) if installed != configured => warn!(
            "⚠️ {} holds the {} server build but the configured platform is {}",
            dir.display(),
            installed,
            configured
        ),
        Some(_) => {}
        None => warn!(
            "⚠️ No {} found in {}",
            configured.executable(),
            dir.display()
        ),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║                🔗 MCLINK 🔗              ║");
    info!("║                  v{:<8}               ║", version);
    info!("║                                          ║");
    info!("║  Bedrock Dedicated Server Bridge         ║");
    info!("║  Script events <-> WebSocket clients     ║");
    info!("╚══════════════════════════════════════════╝");
}
