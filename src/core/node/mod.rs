// src/core/node/mod.rs

//! The peer object: one logical remote endpoint with its identity,
//! liveness bits, load metrics, reference counters, and outgoing frame
//! queue. Request dispatch against a peer lives in [`dispatch`]; local
//! file-system mutations in [`fsops`].

pub mod dispatch;
pub mod fsops;

use crate::core::CmsError;
use crate::core::mask::SMask;
use crate::core::protocol::Frame;
use crate::core::protocol::codes::LoginMod;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::mpsc;

bitflags! {
    /// Liveness and service bits for a peer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u16 {
        const OFFLINE = 1 << 0;
        const SUSPEND = 1 << 1;
        const NOSTAGE = 1 << 2;
        const DISABLE = 1 << 3;
        const GONE    = 1 << 4;
        const BOUND   = 1 << 5;
        const CONN    = 1 << 6;
        const KNOWN   = 1 << 7;
        /// The peer exports at least one writable path.
        const RW      = 1 << 8;
    }
}

/// Mutable peer state guarded by the peer's own mutex.
#[derive(Debug)]
pub struct NodeInfo {
    pub flags: StateFlags,
    pub load: u32,
    pub mass: u32,
    /// Largest free space on the peer, MB.
    pub disk_free: u64,
    /// Disk utilization percent.
    pub disk_util: u32,
    /// Decremented by the ping sweep, reset to 2 by any ping/pong.
    pub ping_pong: i32,
    /// Countdown to the next performance log line.
    pub logload: u32,
}

impl Default for NodeInfo {
    fn default() -> Self {
        NodeInfo {
            flags: StateFlags::empty(),
            load: 0,
            mass: 0,
            disk_free: 0,
            disk_util: 0,
            ping_pong: 2,
            logload: 0,
        }
    }
}

/// One remote peer. Owned by the cluster table while admitted; borrowed
/// references are `(id, instance)`-checked so a recycled slot can never
/// be confused with its previous occupant.
#[derive(Debug)]
pub struct CmsNode {
    pub id: usize,
    pub instance: u64,
    /// Singleton subscriber mask; empty for upstream manager links.
    pub mask: SMask,
    pub roles: LoginMod,
    pub host: String,
    /// Data port clients are redirected to.
    pub port: u16,
    /// Stable node identity supplied by the peer at login.
    pub nid: String,
    /// Log identity: "role host:port".
    pub ident: String,
    /// Preformatted "[addr]:port" for locate rows.
    pub ipv6: String,
    state: Mutex<NodeInfo>,
    ref_a: AtomicU32,
    ref_r: AtomicU32,
    ref_tot_a: AtomicU64,
    ref_tot_r: AtomicU64,
    link: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl CmsNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        instance: u64,
        roles: LoginMod,
        host: String,
        addr: IpAddr,
        port: u16,
        nid: String,
        log_perf: u32,
    ) -> Self {
        let role_name = if roles.contains(LoginMod::MANAGER) {
            "manager"
        } else if roles.contains(LoginMod::SUPERVISOR) {
            "supervisor"
        } else {
            "server"
        };
        let ident = format!("{role_name} {host}:{port}");
        let ipv6 = match addr {
            IpAddr::V4(v4) => format!("[::{v4}]:{port}"),
            IpAddr::V6(v6) => format!("[{v6}]:{port}"),
        };
        let mask = if id < crate::core::mask::STMAX {
            SMask::node(id)
        } else {
            SMask::EMPTY
        };
        CmsNode {
            id,
            instance,
            mask,
            roles,
            host,
            port,
            nid,
            ident,
            ipv6,
            state: Mutex::new(NodeInfo {
                logload: log_perf,
                ..NodeInfo::default()
            }),
            ref_a: AtomicU32::new(0),
            ref_r: AtomicU32::new(0),
            ref_tot_a: AtomicU64::new(0),
            ref_tot_r: AtomicU64::new(0),
            link: Mutex::new(None),
        }
    }

    pub fn is_manager(&self) -> bool {
        self.roles
            .intersects(LoginMod::MANAGER | LoginMod::SUPERVISOR)
    }

    /// Attaches the outgoing frame queue once the link handshake is done.
    pub fn bind(&self, tx: mpsc::UnboundedSender<Frame>) {
        *self.link.lock() = Some(tx);
        let mut st = self.state.lock();
        st.flags |= StateFlags::BOUND | StateFlags::CONN;
        st.flags -= StateFlags::OFFLINE;
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().flags.contains(StateFlags::BOUND)
    }

    /// Enqueues a frame on the peer's link. A closed queue means the
    /// writer is gone and the link is as good as lost.
    pub fn send(&self, frame: Frame) -> Result<(), CmsError> {
        let link = self.link.lock();
        match link.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(CmsError::TransportLost(self.ident.clone())),
        }
    }

    /// Marks the peer offline and tears down its link. Idempotent and
    /// safe against concurrent dispatch.
    pub fn disc(&self, reason: &str) {
        {
            let mut st = self.state.lock();
            st.flags |= StateFlags::OFFLINE;
            st.flags -= StateFlags::CONN | StateFlags::BOUND;
        }
        if self.link.lock().take().is_some() {
            tracing::info!("{} disconnected: {}", self.ident, reason);
        }
    }

    /// Runs `f` with the peer state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut NodeInfo) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn flags(&self) -> StateFlags {
        self.state.lock().flags
    }

    /// A peer is selectable when it is online and not suspended or
    /// administratively disabled.
    pub fn is_selectable(&self) -> bool {
        !self
            .flags()
            .intersects(StateFlags::OFFLINE | StateFlags::SUSPEND | StateFlags::DISABLE)
    }

    pub fn update_space(&self, free_mb: u64, util: u32) {
        let mut st = self.state.lock();
        st.disk_free = free_mb;
        st.disk_util = util;
    }

    /// Selection scores; `(load, mass, disk_free, disk_util)`.
    pub fn scores(&self) -> (u32, u32, u64, u32) {
        let st = self.state.lock();
        (st.load, st.mass, st.disk_free, st.disk_util)
    }

    /// Bumps the active or reserve reference counters after selection.
    pub fn add_ref(&self, reserve: bool) {
        if reserve {
            self.ref_r.fetch_add(1, Ordering::Relaxed);
            self.ref_tot_r.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ref_a.fetch_add(1, Ordering::Relaxed);
            self.ref_tot_a.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn ref_a(&self) -> u32 {
        self.ref_a.load(Ordering::Relaxed)
    }

    pub fn ref_r(&self) -> u32 {
        self.ref_r.load(Ordering::Relaxed)
    }

    pub fn ref_totals(&self) -> (u64, u64) {
        (
            self.ref_tot_a.load(Ordering::Relaxed),
            self.ref_tot_r.load(Ordering::Relaxed),
        )
    }

    /// Clears the windowed reference counters; the monitor does this
    /// periodically so `SelbyRef` tracks recent traffic.
    pub fn reset_refs(&self) {
        self.ref_a.store(0, Ordering::Relaxed);
        self.ref_r.store(0, Ordering::Relaxed);
    }
}
