//! Tunnel Supervisor Daemon (tunsvcd)
//!
//! Runs the connection manager as a long-lived service and offers a few
//! one-shot maintenance commands.
//!
//! # Usage
//!
//! ```bash
//! # Run the service
//! tunsvcd --config /etc/tunsvc/tunsvc.toml run
//!
//! # Show virtual adapter usage
//! tunsvcd adapters --json
//!
//! # Bring up one profile in the foreground until Ctrl+C
//! tunsvcd connect --id work --profile /etc/tunsvc/work.ovpn --password-file ~/.work-pass
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libtunsvc::{ConnectionManager, ServiceConfig, TunsvcResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Tunnel Supervisor Daemon
#[derive(Parser, Debug)]
#[command(name = "tunsvcd")]
#[command(author = "tunsvc contributors")]
#[command(version)]
#[command(about = "Tunnel Supervisor Daemon - launches and tracks VPN tunnel processes", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as a service until SIGTERM/SIGINT
    Run,
    /// Refresh and print virtual adapter usage
    Adapters {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the network reset command batch
    ResetNetworking,
    /// Start one profile and keep it up until Ctrl+C
    Connect {
        /// Connection id
        #[arg(long)]
        id: String,
        /// Profile config path
        #[arg(long)]
        profile: PathBuf,
        /// File whose first line is the password
        #[arg(long)]
        password_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    let manager = Arc::new(ConnectionManager::new(config));

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(manager).await?,
        Commands::Adapters { json } => {
            let counts = manager.update_adapter_inventory().await;
            if json {
                println!("{}", serde_json::to_string(&counts)?);
            } else {
                println!("{}/{}", counts.used, counts.available);
            }
        }
        Commands::ResetNetworking => {
            let failed = manager.reset_networking().await;
            if failed > 0 {
                anyhow::bail!("{} network reset command(s) failed", failed);
            }
        }
        Commands::Connect { id, profile, password_file } => {
            let password = match password_file {
                Some(path) => Some(read_password(&path)?),
                None => None,
            };
            connect_foreground(manager, &id, profile, password).await?;
        }
    }

    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("tunsvcd={},libtunsvc={}", log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr)
        .init();
}

async fn run_service(manager: Arc<ConnectionManager>) -> TunsvcResult<()> {
    info!("Starting Tunnel Supervisor Daemon (tunsvcd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let signal_manager = manager.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => signal_manager.stop(),
            Err(e) => error!("Signal handler error: {}", e),
        }
    });

    manager.start().await;

    info!("Shutting down Tunnel Supervisor Daemon...");
    manager.stop_all().await;
    wait_for_tunnels(&manager).await;

    info!("Tunnel Supervisor Daemon stopped");
    Ok(())
}

async fn connect_foreground(
    manager: Arc<ConnectionManager>,
    id: &str,
    profile: PathBuf,
    password: Option<String>,
) -> Result<()> {
    let snapshot = manager.start_profile(id, &profile, password.as_deref()).await?;
    println!("{}", serde_json::to_string(&snapshot)?);

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let signal = wait_for_shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            result = &mut signal => {
                result?;
                info!("Stopping profile {}", id);
                manager.stop_profile(id).await;
                wait_for_tunnels(&manager).await;
                return Ok(());
            }
            _ = poll.tick() => {
                if manager.status(id).await.is_none() {
                    warn!("Tunnel for profile {} exited", id);
                    return Ok(());
                }
            }
        }
    }
}

/// Give monitors a bounded time to observe their processes exiting
async fn wait_for_tunnels(manager: &ConnectionManager) {
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while !manager.connections().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    if drained.is_err() {
        warn!("Some tunnels did not exit within 10s");
    }
}

fn read_password(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading password file {}", path.display()))?;
    Ok(content.lines().next().unwrap_or_default().to_string())
}

/// Wait for SIGTERM/SIGINT (Ctrl+C on other platforms)
async fn wait_for_shutdown_signal() -> TunsvcResult<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}
