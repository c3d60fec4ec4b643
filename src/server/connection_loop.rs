// src/server/connection_loop.rs

//! Final startup phase: the accept loop. Runs until the process is told
//! to shut down.

use super::context::ServerContext;
use crate::connection::PeerConnection;
use tokio::signal;
use tracing::{debug, info, warn};

pub async fn run(mut ctx: ServerContext) {
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                let _ = ctx.shutdown_tx.send(());
                break;
            }
            accepted = ctx.listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    debug!("accepted connection from {}", addr);
                    let conn = PeerConnection::new(
                        socket,
                        addr,
                        ctx.fed.clone(),
                        ctx.shutdown_tx.subscribe(),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = conn.run().await {
                            debug!("connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
    }

    // Give background tasks a moment to observe the shutdown signal.
    ctx.background_tasks.shutdown().await;
    info!("server stopped");
}
