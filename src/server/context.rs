// src/server/context.rs

use crate::core::prepare::PrepArgs;
use crate::core::state::FederationState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub fed: Arc<FederationState>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub prep_rx: Option<mpsc::UnboundedReceiver<PrepArgs>>,
    pub background_tasks: JoinSet<()>,
}
