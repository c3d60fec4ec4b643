// src/server/initialization.rs

//! First startup phase: bind the listener and build the shared services.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::FederationState;
use anyhow::Result;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Listener setup failure, distinguished so the binary can exit with the
/// bind-error status.
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

pub async fn setup(config: Config) -> Result<ServerContext> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await.map_err(|source| BindError {
        addr: addr.clone(),
        source,
    })?;
    info!(
        "OpalD {} listening on {} as {}",
        env!("CARGO_PKG_VERSION"),
        addr,
        config.role.as_str()
    );

    let (fed, prep_rx) = FederationState::new(config);
    let (shutdown_tx, _) = broadcast::channel(16);

    Ok(ServerContext {
        fed,
        listener,
        shutdown_tx,
        prep_rx: Some(prep_rx),
        background_tasks: JoinSet::new(),
    })
}
