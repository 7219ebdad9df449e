//! Servidor Axum para revisão interativa de redações, com eventos por WebSocket.

mod detection;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use redact_core::RedactConfig;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

/// Intervalo da limpeza de templates expirados.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "redact-web", about = "Revisão e exportação de documentos redigidos")]
struct Args {
    /// Arquivo de configuração TOML
    #[arg(long, env = "REDACT_CONFIG", default_value = "redact.toml")]
    config: PathBuf,

    /// Endereço de escuta
    #[arg(long, env = "REDACT_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = RedactConfig::load(&args.config)
        .with_context(|| format!("carregando {}", args.config.display()))?;

    let shutdown = CancellationToken::new();
    let state = AppState::new(config, shutdown.clone())?;

    tokio::spawn(purge_templates(state.clone(), shutdown.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("bind em {}", args.bind))?;
    info!(addr = %args.bind, "servidor de redação iniciado");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("desligando");
            signal.cancel();
        })
        .await?;
    Ok(())
}

/// Remove periodicamente os templates vencidos até o desligamento.
async fn purge_templates(state: AppState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = state.templates.purge_expired(Utc::now()) {
                    tracing::error!(error = %e, "falha ao limpar templates expirados");
                }
            }
        }
    }
}
