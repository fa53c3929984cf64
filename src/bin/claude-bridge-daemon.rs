//! claude-bridge-daemon: Background process that owns bridge sessions.
//!
//! Sessions live here so that any number of adapters can attach to them and
//! they survive the adapters that created them.
//!
//! Usage:
//!   claude-bridge-daemon          # Run daemon (normally started by the CLI)
//!   claude-bridge-daemon --status # Show running sessions
//!   claude-bridge-daemon --stop   # Graceful shutdown

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use claude_bridge::config::BridgeConfig;
use claude_bridge::daemon::{socket_path, DaemonServer};
use claude_bridge::daemon_client::{self, DaemonClient};
use claude_bridge::{logging, SessionRegistry};

#[derive(Debug, Parser)]
#[command(name = "claude-bridge-daemon", version, about = "Background process for bridge sessions")]
struct Args {
    /// Show running sessions and exit
    #[arg(long, conflicts_with = "stop")]
    status: bool,

    /// Ask a running daemon to shut down
    #[arg(long)]
    stop: bool,

    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.status {
        return show_status();
    }
    if args.stop {
        return stop_daemon();
    }

    let config = load_config(args.config.as_deref())?;
    logging::init(&config.logging.level);

    let registry = Arc::new(SessionRegistry::new(config));
    DaemonServer::new(registry, socket_path()).run()
}

fn load_config(path: Option<&std::path::Path>) -> Result<BridgeConfig> {
    let Some(path) = path else {
        return BridgeConfig::load().context("Failed to load config");
    };
    let mut config = BridgeConfig::load_from(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn show_status() -> Result<()> {
    let client = DaemonClient::at(socket_path())?;
    let (sessions, stats) = client.list_sessions()?;

    if sessions.is_empty() {
        println!("Daemon running, no sessions");
        return Ok(());
    }

    println!(
        "Daemon running with {} session(s), {} active, {} awaiting a prompt:",
        stats.total, stats.active, stats.awaiting_prompt
    );
    for session in sessions {
        println!(
            "  {} [{}] {} pid={} subscribers={}",
            session.session_id,
            session.state,
            session.working_dir.display(),
            session
                .pid
                .map_or_else(|| "-".to_string(), |pid| pid.to_string()),
            session.subscriber_count,
        );
    }
    Ok(())
}

fn stop_daemon() -> Result<()> {
    if !daemon_client::is_daemon_running() {
        println!("Daemon not running");
        return Ok(());
    }
    daemon_client::stop_daemon()?;
    println!("Daemon shutting down");
    Ok(())
}
