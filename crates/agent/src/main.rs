//! synctap agent
//!
//! Serves a driver against an in-memory UI loaded from a fixture file.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use synctap_agent::{build_session, AgentConfig, VirtualHost, VirtualRecorder};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "synctap-agent")]
#[command(about = "synctap agent - executes driver actions once the app is idle")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "synctap.toml")]
    config: PathBuf,

    /// Driver WebSocket endpoint
    #[arg(short, long, env = "SYNCTAP_SERVER")]
    server: Option<String>,

    /// Session identifier sent at login
    #[arg(long, env = "SYNCTAP_SESSION_ID")]
    session_id: Option<String>,

    /// JSON fixture describing the UI to serve
    #[arg(short, long)]
    fixture: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("synctap agent v{}", synctap_common::VERSION);

    let mut config = AgentConfig::load(&cli.config)?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(session_id) = cli.session_id {
        config.session_id = Some(session_id);
    }
    config.validate()?;

    let host = match &cli.fixture {
        Some(path) => {
            info!("Loading fixture {}", path.display());
            VirtualHost::load(path)?
        }
        None => VirtualHost::blank(),
    };

    if let Some(wait) = config.sync.wait_for_debugger_ms {
        info!("Waiting {}ms for a debugger to attach", wait);
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }

    let session = build_session(config, Arc::new(host), Arc::new(VirtualRecorder::default()));
    let shutdown = session.shutdown_token();

    // Fixture UIs are ready as soon as they are loaded
    session.context().mark_launched();

    let handle = tokio::spawn(session.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }

    if let Err(fault) = handle.await? {
        error!("Session ended with a protocol fault: {}", fault);
        anyhow::bail!(fault);
    }

    info!("Agent shutdown complete");
    Ok(())
}
