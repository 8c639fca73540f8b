use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use cropside::config;
use cropside::{AppState, build_router};

#[derive(Parser)]
#[command(name = "cropside")]
#[command(about = "Coordination server for collaborative crop-disease diagnosis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination server in the foreground
    Serve(ServeArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to config.toml (defaults to ./config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let state = AppState::new(&config);
    let app = build_router(state.clone());

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("cropside listening on {}", listener.local_addr()?);
    if let Some(turn) = &config.signaling.turn_server_url {
        info!("TURN relay fallback enabled via {turn}");
    }

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")?;

    // Tear down the sweep, maintenance, and per-session timers.
    state.shutdown();
    Ok(())
}
