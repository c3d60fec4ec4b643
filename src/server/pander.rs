// src/server/pander.rs

//! Upstream subscription: one loop per configured manager that connects,
//! logs in, serves the manager's requests, and reconnects with backoff —
//! honoring alternate targets handed down by `try` redirections.

use crate::config::{ManagerAddr, Role};
use crate::connection::handler::{read_loop, write_loop, CmsFramed};
use crate::core::CmsError;
use crate::core::mask::STMAX;
use crate::core::node::CmsNode;
use crate::core::protocol::codes::LoginMod;
use crate::core::protocol::frame::CmsFrameCodec;
use crate::core::protocol::request::{login_frame, ExportDecl};
use crate::core::protocol::ReqCode;
use crate::core::state::FederationState;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Keeps this node subscribed to one upstream manager for the life of
/// the process.
pub async fn run(
    fed: Arc<FederationState>,
    seed: ManagerAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut target = seed.clone();
    let mut backoff = Duration::from_secs(1);
    loop {
        match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(socket) => {
                backoff = Duration::from_secs(1);
                match subscribe(&fed, socket, &target, &mut shutdown_rx).await {
                    Ok(reason) if reason == "shutdown" => return,
                    Ok(reason) => warn!("{}:{} dropped us: {}", target.host, target.port, reason),
                    Err(e) => warn!("{}:{} subscription failed: {}", target.host, target.port, e),
                }
            }
            Err(e) => warn!("cannot reach {}:{}: {}", target.host, target.port, e),
        }

        // A try redirection replaces our target until it drains.
        target = {
            let mut alts = fed.alternates.lock();
            if alts.is_empty() {
                seed.clone()
            } else {
                alts.remove(0)
            }
        };

        // Jitter keeps a cell's servers from stampeding a manager that
        // just came back.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(backoff + jitter) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One bound session with the manager: login, ack, then serve its
/// requests until the link ends. Returns the teardown reason.
async fn subscribe(
    fed: &Arc<FederationState>,
    socket: TcpStream,
    target: &ManagerAddr,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<String, CmsError> {
    let peer_ip = socket.peer_addr()?.ip();
    let mut framed: CmsFramed = Framed::new(socket, CmsFrameCodec);

    let mut roles = if fed.config.role == Role::Supervisor {
        LoginMod::SUPERVISOR
    } else {
        LoginMod::SERVER
    };
    if !fed.config.disk_ss() {
        roles |= LoginMod::NOSTAGE;
    }
    let exports: Vec<ExportDecl> = fed
        .config
        .exports
        .iter()
        .map(|e| ExportDecl {
            path: e.path.clone(),
            write: e.write,
            stage: e.stage,
        })
        .collect();
    let (free_mb, util) = fed.meter.free_space();
    framed
        .send(login_frame(
            0,
            roles.bits(),
            &fed.config.node_id(),
            fed.config.port,
            free_mb,
            util,
            &exports,
        ))
        .await?;

    match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(ack))) if ack.code == ReqCode::Login => {}
        Ok(Some(Ok(frame))) => {
            return Err(CmsError::BadRequest(format!(
                "expected login ack, got {}",
                frame.code
            )));
        }
        Ok(Some(Err(e))) => return Err(e),
        Ok(None) => return Err(CmsError::TransportLost("closed during handshake".into())),
        Err(_) => return Err(CmsError::Timeout),
    }

    let node = Arc::new(CmsNode::new(
        STMAX,
        fed.managers.next_instance(),
        LoginMod::MANAGER,
        target.host.clone(),
        peer_ip,
        target.port,
        format!("{}:{}", target.host, target.port),
        0,
    ));
    let (sink, stream) = framed.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, rx));
    node.bind(tx);
    fed.managers.add(node.clone())?;
    info!("subscribed to {}", node.ident);

    let reason = read_loop(fed, &node, stream, shutdown_rx).await;
    fed.evict(&node, &reason);
    writer.abort();
    Ok(reason)
}
