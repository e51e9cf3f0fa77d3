//! `modelgate`: run the gateway from a YAML configuration file.
//!
//! # Usage
//!
//! ```bash
//! modelgate --config config.yaml
//! modelgate --config config.yaml --port 8080 --log-level debug
//! MODELGATE_MODEL_GPT_4O_API_KEY=sk-... modelgate
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use modelgate::config::GatewayConfig;
use modelgate_server::{AppState, build_router, serve};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Provider-agnostic LLM gateway.
#[derive(Parser)]
#[command(name = "modelgate", version, about = "Provider-agnostic LLM gateway")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Host to bind (overrides the configuration file and environment).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the configuration file and environment).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!(models = ?config.model_names(), "models configured");

    let state = AppState::new(Arc::new(config));
    let shutdown = state.shutdown.clone();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                on_signal.cancel();
            }
            Err(e) => warn!("cannot listen for shutdown signal: {e}"),
        }
    });

    serve(listener, build_router(state), shutdown).await?;
    Ok(())
}
