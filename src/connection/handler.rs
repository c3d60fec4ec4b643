// src/connection/handler.rs

//! Defines the `PeerConnection` which manages the full lifecycle of an
//! inbound peer link: login handshake, admission, the reader loop, and
//! eviction when the link dies.

use crate::core::CmsError;
use crate::core::node::dispatch::Dispatcher;
use crate::core::node::{CmsNode, StateFlags};
use crate::core::protocol::codes::LoginMod;
use crate::core::protocol::frame::{CmsFrameCodec, Frame};
use crate::core::protocol::request::{RRData, avail_frame};
use crate::core::protocol::ReqCode;
use crate::core::state::FederationState;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// How long a fresh connection may take to present its login.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

pub type CmsFramed = Framed<TcpStream, CmsFrameCodec>;

/// Manages the full lifecycle of one inbound peer connection.
pub struct PeerConnection {
    framed: CmsFramed,
    addr: SocketAddr,
    fed: Arc<FederationState>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl PeerConnection {
    pub fn new(
        socket: TcpStream,
        addr: SocketAddr,
        fed: Arc<FederationState>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        PeerConnection {
            framed: Framed::new(socket, CmsFrameCodec),
            addr,
            fed,
            shutdown_rx,
        }
    }

    /// The main event loop: admit on login, then dispatch frames until
    /// the link drops or dispatch demands a teardown.
    pub async fn run(mut self) -> Result<(), CmsError> {
        let login = match timeout(LOGIN_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(frame))) if frame.code == ReqCode::Login => frame,
            Ok(Some(Ok(frame))) => {
                warn!("{} sent {} before login", self.addr, frame.code);
                let reply = Frame::error(frame.streamid, libc::EACCES as u32, "login required");
                let _ = self.framed.send(reply).await;
                return Ok(());
            }
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Ok(()),
            Err(_) => {
                debug!("{} never logged in", self.addr);
                return Ok(());
            }
        };

        let arg = RRData::decode(&login)?;
        let node = match admit(&self.fed, &arg, self.addr) {
            Ok(node) => node,
            Err(e) => {
                warn!("{} login rejected: {}", self.addr, e);
                let reply = Frame::error(login.streamid, e.wire_errno(), &e.to_string());
                let _ = self.framed.send(reply).await;
                return Ok(());
            }
        };

        let (sink, stream) = self.framed.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx));
        node.bind(tx);
        // Login acknowledgement carries the assigned subscriber id.
        let _ = node.send(Frame::bare(ReqCode::Login, node.id as u16, 0));

        let reason = read_loop(&self.fed, &node, stream, &mut self.shutdown_rx).await;
        self.fed.evict(&node, &reason);
        writer.abort();
        Ok(())
    }
}

/// Admission: assign a subscriber slot, record the declared exports, and
/// seed the peer's space figures from the login.
fn admit(
    fed: &Arc<FederationState>,
    arg: &RRData,
    addr: SocketAddr,
) -> Result<Arc<CmsNode>, CmsError> {
    let roles = LoginMod::from_bits_truncate(arg.modifier);
    let role_class = roles
        & (LoginMod::SERVER | LoginMod::SUPERVISOR | LoginMod::MANAGER | LoginMod::PEER);
    if role_class.bits().count_ones() != 1 {
        return Err(CmsError::BadRequest(
            "login must declare exactly one role".to_string(),
        ));
    }
    let host = addr.ip().to_string();
    let node = fed.table.admit(|id, instance| {
        Arc::new(CmsNode::new(
            id,
            instance,
            roles,
            host.clone(),
            addr.ip(),
            arg.port,
            arg.nid.clone(),
            fed.config.log_perf,
        ))
    })?;

    let mut rw = false;
    let mut stage = false;
    for e in &arg.exports {
        fed.paths.add(&e.path, node.id, e.write, e.stage);
        rw |= e.write;
        stage |= e.stage;
    }
    node.with_state(|st| {
        if rw {
            st.flags |= StateFlags::RW;
        }
        if roles.contains(LoginMod::NOSTAGE) || !stage {
            st.flags |= StateFlags::NOSTAGE;
        }
        if roles.contains(LoginMod::SUSPEND) {
            st.flags |= StateFlags::SUSPEND;
        }
        st.disk_free = arg.dsk_free;
        st.disk_util = arg.dsk_util;
    });

    // A newly logged-in rw node may raise the cell's free-space
    // watermark; crossing zero makes the one-shot announcement.
    if rw && arg.dsk_free > 0 {
        let old = fed.meter.raise_last_free(arg.dsk_free);
        if old == 0 && arg.dsk_free >= fed.config.disk.min_mb {
            fed.managers
                .inform(&avail_frame(0, arg.dsk_free, arg.dsk_util));
        }
    }

    fed.sync_state();
    Ok(node)
}

/// Dispatches frames from one peer in arrival order until the link ends.
/// Returns the teardown reason.
pub(crate) async fn read_loop(
    fed: &Arc<FederationState>,
    node: &Arc<CmsNode>,
    mut stream: SplitStream<CmsFramed>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> String {
    let dispatcher = Dispatcher::new(fed.clone());
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("{} link closing for shutdown", node.ident);
                return "shutdown".to_string();
            }
            next = stream.next() => match next {
                Some(Ok(frame)) => {
                    if let Err(e) = dispatcher.route(node, frame).await {
                        return e.to_string();
                    }
                }
                Some(Err(e)) => {
                    debug!("{} link error: {}", node.ident, e);
                    return e.to_string();
                }
                None => return "link closed by peer".to_string(),
            }
        }
    }
}

/// Drains the peer's outgoing queue onto the socket. A failed write is a
/// lost link; the queue is dropped and the reader will notice.
pub(crate) async fn write_loop(
    mut sink: SplitSink<CmsFramed, Frame>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
