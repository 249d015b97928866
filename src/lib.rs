//! checkrun -- on-demand verification runs against a live deployment.
//!
//! This crate provides the check registry, the run coordinator with its
//! sequential and parallel strategies, the auth token cache, SQLite-backed
//! run history, and the administrative HTTP API.

pub mod api;
pub mod auth;
pub mod checks;
pub mod config;
pub mod coordinator;
pub mod model;
pub mod storage;

use anyhow::Result;

use crate::config::{Config, LoggingConfig};
use crate::coordinator::Coordinator;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Output goes to stderr.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A second init (tests, embedding) is not an error worth surfacing.
    if logging.json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

/// Start the checkrun daemon: coordinator plus HTTP API, until Ctrl-C.
pub async fn serve(config: &Config) -> Result<()> {
    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let coordinator = Coordinator::from_config(config)?;

    let addr: std::net::SocketAddr = config.server.bind.parse()?;
    let app = api::router(api::state::AppState::new(coordinator));

    tracing::info!(%addr, target = %config.target.base_url, "checkrun listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}
