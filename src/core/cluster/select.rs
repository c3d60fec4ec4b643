// src/core/cluster/select.rs

//! Server selection: candidate narrowing through the path index and the
//! location cache, the load/reference pickers, and the broadcast-then-wait
//! protocol for cache misses.

use crate::core::CmsError;
use crate::core::cache::paths::PathInfo;
use crate::core::mask::SMask;
use crate::core::node::{CmsNode, StateFlags};
use crate::core::protocol::ReqCode;
use crate::core::protocol::codes::StateMod;
use crate::core::protocol::frame::Frame;
use crate::core::protocol::request::path_frame;
use crate::core::state::FederationState;
use bitflags::bitflags;
use std::sync::Arc;
use tracing::debug;

bitflags! {
    /// Options steering one selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SelectOpts: u32 {
        const REFRESH  = 1 << 0;
        const WRITE    = 1 << 1;
        const TRUNC    = 1 << 2;
        const NEWFILE  = 1 << 3;
        const ASAP     = 1 << 4;
        const ONLINE   = 1 << 5;
        const NOBIND   = 1 << 6;
        const PEERS    = 1 << 7;
        const DEFER    = 1 << 8;
        const PENDING  = 1 << 9;
        const ADVISORY = 1 << 10;
    }
}

/// Ephemeral record carrying one selection.
#[derive(Debug, Clone)]
pub struct SelectRequest {
    pub path: String,
    pub opts: SelectOpts,
    /// Subscribers to avoid.
    pub nmask: SMask,
}

impl SelectRequest {
    pub fn new(path: impl Into<String>, opts: SelectOpts) -> Self {
        SelectRequest {
            path: path.into(),
            opts,
            nmask: SMask::EMPTY,
        }
    }
}

/// What a selection resolved to. `Node` carries the chosen peer so
/// callers that must talk to it (the prepare worker) can, while the wire
/// response only needs its host and data port.
#[derive(Debug, Clone)]
pub enum Choice {
    Node(Arc<CmsNode>),
    Wait(u32),
    Error(CmsError),
}

/// What the requester is told.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutcome {
    Redirect { host: String, port: u16 },
    Wait(u32),
    Error(CmsError),
}

impl SelectOutcome {
    /// Serializes the outcome as the wire reply on `streamid`.
    pub fn into_frame(self, streamid: u16) -> Frame {
        match self {
            SelectOutcome::Redirect { host, port } => Frame::redirect(streamid, port, &host),
            SelectOutcome::Wait(d) => Frame::wait(streamid, d),
            SelectOutcome::Error(e) => Frame::error(streamid, e.wire_errno(), &e.to_string()),
        }
    }
}

/// Identity of a requester wanting async completion of a broadcast.
#[derive(Debug, Clone, Copy)]
pub struct WaiterKey {
    pub node: usize,
    pub instance: u64,
    pub streamid: u16,
}

/// Tallies of why candidates fell out of selection, for delay policy.
#[derive(Debug, Default, Clone, Copy)]
struct SurvivorCounts {
    offline: u32,
    suspended: u32,
    full: u32,
    short: u32,
}

/// Performs one selection per the decision procedure: path capability,
/// cache consultation, optional broadcast with suspended continuation,
/// then the load/reference pick. A reference is reserved on the chosen
/// peer before it is returned.
pub fn choose(fed: &FederationState, req: &SelectRequest, waiter: Option<WaiterKey>) -> Choice {
    let pinfo = match fed.paths.find(&req.path) {
        Some(p) => p,
        None if req.opts.contains(SelectOpts::PEERS) => PathInfo::default(),
        None => return Choice::Error(CmsError::PathUnknown),
    };

    let base = if req.opts.contains(SelectOpts::WRITE) {
        pinfo.rwvec
    } else {
        pinfo.rovec
    };
    let mut candidates = base & !req.nmask;
    if candidates.is_empty() {
        return Choice::Error(CmsError::NoServers);
    }

    if req.opts.contains(SelectOpts::REFRESH) {
        return broadcast_state(fed, req, pinfo.rovec & !req.nmask, waiter, false);
    }

    // Creating a file needs no current holder; skip the cache.
    let creating = req.opts.contains(SelectOpts::WRITE)
        && req.opts.intersects(SelectOpts::NEWFILE | SelectOpts::TRUNC);

    if !creating {
        let loc = fed.cache.get_file(&req.path, candidates);
        let have = loc.hf & candidates;
        if loc.hit && !have.is_empty() {
            candidates = have;
        } else if loc.hit && loc.bf.is_empty() {
            // Entry is settled: nobody in the candidate set has the file.
            let pending = loc.pf & candidates;
            if !pending.is_empty() && !req.opts.contains(SelectOpts::ONLINE) {
                return Choice::Wait(fed.config.delays.stage.as_secs() as u32);
            }
            return Choice::Error(CmsError::NoServers);
        } else {
            // Miss, or bits still unqueried: ask the subscribers.
            let ask = if loc.hit { loc.bf } else { pinfo.rovec };
            return broadcast_state(fed, req, ask, waiter, false);
        }
    }

    pick(fed, req, candidates, pinfo)
}

/// `choose` mapped onto the wire outcome.
pub fn select(
    fed: &FederationState,
    req: &SelectRequest,
    waiter: Option<WaiterKey>,
) -> SelectOutcome {
    match choose(fed, req, waiter) {
        Choice::Node(node) => SelectOutcome::Redirect {
            host: node.host.clone(),
            port: node.port,
        },
        Choice::Wait(d) => SelectOutcome::Wait(d),
        Choice::Error(e) => SelectOutcome::Error(e),
    }
}

/// Issues the `state` query to `ask`, suspends the requester if it asked
/// for async completion, and hands back the bounded poll interval.
fn broadcast_state(
    fed: &FederationState,
    req: &SelectRequest,
    ask: SMask,
    waiter: Option<WaiterKey>,
    locate: bool,
) -> Choice {
    if ask.is_empty() {
        return Choice::Error(CmsError::NoServers);
    }
    let modifier = if req.opts.contains(SelectOpts::REFRESH) {
        StateMod::REFRESH.bits()
    } else {
        0
    };
    let query = path_frame(ReqCode::State, 0, modifier, &req.path);
    debug!("state query for {} to {}", req.path, ask);
    fed.broadcast(ask, &query);
    fed.cache.mark_broadcast(&req.path, ask);
    if let Some(key) = waiter {
        fed.rrq.enqueue(
            &req.path,
            key.node,
            key.instance,
            key.streamid,
            req.opts,
            req.nmask,
            locate,
        );
    }
    Choice::Wait(fed.config.delays.lookup.as_secs() as u32)
}

/// Chooses one bit of `mask` by policy and reserves a reference on it.
fn pick(fed: &FederationState, req: &SelectRequest, mask: SMask, pinfo: PathInfo) -> Choice {
    let want_write = req.opts.contains(SelectOpts::WRITE);
    let mut counts = SurvivorCounts::default();

    let healthy = filter(fed, mask, want_write, true, &mut counts);
    let survivors = if healthy.is_empty() && !want_write {
        // Reads fall back to disks below the preference thresholds.
        let relaxed = filter(fed, mask, false, false, &mut counts);
        counts.short = 0;
        relaxed
    } else {
        healthy
    };

    if survivors.is_empty() {
        return no_survivors(fed, req, pinfo, counts);
    }

    let by_load = fed.table.next_picker();
    let chosen = if by_load {
        sel_by_load(&survivors)
    } else {
        sel_by_ref(&survivors)
    };
    let Some(node) = chosen else {
        return no_survivors(fed, req, pinfo, counts);
    };

    // A no-bind (stat) selection reports the choice without reserving it.
    if !req.opts.contains(SelectOpts::NOBIND) {
        node.add_ref(req.opts.contains(SelectOpts::DEFER));
    }
    debug!(
        "{} selected for {} ({})",
        node.ident,
        req.path,
        if by_load { "by load" } else { "by refs" }
    );
    Choice::Node(node)
}

/// Applies the health and disk filters over the members of `mask`.
fn filter(
    fed: &FederationState,
    mask: SMask,
    want_write: bool,
    prefer_disk: bool,
    counts: &mut SurvivorCounts,
) -> Vec<Arc<CmsNode>> {
    let disk = &fed.config.disk;
    let mut out = Vec::new();
    for node in fed.table.members(mask) {
        let flags = node.flags();
        if flags.contains(StateFlags::OFFLINE) {
            counts.offline += 1;
            continue;
        }
        if flags.intersects(StateFlags::SUSPEND | StateFlags::DISABLE) {
            counts.suspended += 1;
            continue;
        }
        let (_, _, free_mb, util) = node.scores();
        if want_write && free_mb < disk.min_free_mb {
            counts.full += 1;
            continue;
        }
        if prefer_disk && (free_mb < disk.min_mb || util > disk.util_max) {
            counts.short += 1;
            continue;
        }
        out.push(node);
    }
    out
}

/// Argmin of mass; ties break toward the lower subscriber id.
fn sel_by_load(nodes: &[Arc<CmsNode>]) -> Option<Arc<CmsNode>> {
    nodes.iter().min_by_key(|n| (n.scores().1, n.id)).cloned()
}

/// Argmin of active references; ties break toward the lower subscriber id.
fn sel_by_ref(nodes: &[Arc<CmsNode>]) -> Option<Arc<CmsNode>> {
    nodes.iter().min_by_key(|n| (n.ref_a(), n.id)).cloned()
}

/// Delay policy when nothing survived the filters.
fn no_survivors(
    fed: &FederationState,
    req: &SelectRequest,
    pinfo: PathInfo,
    counts: SurvivorCounts,
) -> Choice {
    let delays = &fed.config.delays;
    // A staging-capable set can still produce the file; hold the client
    // for the stage interval.
    if !pinfo.ssvec.is_empty() && !req.opts.contains(SelectOpts::ONLINE) {
        return Choice::Wait(delays.stage.as_secs() as u32);
    }
    if counts.offline + counts.suspended + counts.short > 0 {
        return Choice::Wait(delays.retry.as_secs() as u32);
    }
    if counts.full > 0 {
        return Choice::Error(CmsError::FsError(
            libc::ENOSPC,
            "insufficient space on any eligible server".to_string(),
        ));
    }
    Choice::Error(CmsError::NoServers)
}

/// What a locate produced: a formatted candidate list or a deferral.
#[derive(Debug, Clone, PartialEq)]
pub enum LocateOutcome {
    List(String),
    Wait(u32),
    Error(CmsError),
}

impl LocateOutcome {
    /// Serializes the outcome as the wire reply on `streamid`.
    pub fn into_frame(self, streamid: u16) -> Frame {
        match self {
            LocateOutcome::List(text) => Frame::data(streamid, 0, text.as_bytes()),
            LocateOutcome::Wait(d) => Frame::wait(streamid, d),
            LocateOutcome::Error(e) => Frame::error(streamid, e.wire_errno(), &e.to_string()),
        }
    }
}

/// Location query: like select, but returns every surviving candidate
/// formatted for the caller instead of binding one.
pub fn locate(
    fed: &FederationState,
    req: &SelectRequest,
    waiter: Option<WaiterKey>,
) -> LocateOutcome {
    let Some(pinfo) = fed.paths.find(&req.path) else {
        return LocateOutcome::Error(CmsError::PathUnknown);
    };
    let candidates = pinfo.rovec & !req.nmask;
    if candidates.is_empty() {
        return LocateOutcome::Error(CmsError::NoServers);
    }

    if req.opts.contains(SelectOpts::REFRESH) {
        return match broadcast_state(fed, req, candidates, waiter, true) {
            Choice::Wait(d) => LocateOutcome::Wait(d),
            _ => LocateOutcome::Error(CmsError::NoServers),
        };
    }

    let loc = fed.cache.get_file(&req.path, candidates);
    let present = (loc.hf | loc.pf) & candidates;
    if present.is_empty() && (!loc.hit || !loc.bf.is_empty()) {
        let ask = if loc.hit { loc.bf } else { pinfo.rovec };
        return match broadcast_state(fed, req, ask, waiter, true) {
            Choice::Wait(d) => LocateOutcome::Wait(d),
            _ => LocateOutcome::Error(CmsError::NoServers),
        };
    }
    if present.is_empty() {
        return LocateOutcome::Error(CmsError::NoServers);
    }

    let listing = fed.table.format_locate(present, loc.pf, pinfo.rwvec);
    if listing.is_empty() {
        return LocateOutcome::Error(CmsError::NoServers);
    }
    LocateOutcome::List(listing)
}

/// Resumes every continuation suspended on `path` after a presence
/// change. Each waiter re-runs its query against the now-updated cache
/// and the reply goes out on the original stream.
pub fn resume_waiters(fed: &FederationState, path: &str) {
    for info in fed.rrq.take(path) {
        let Some(requester) = fed.table.get(info.node, info.instance) else {
            continue;
        };
        let req = SelectRequest {
            path: path.to_string(),
            opts: info.opts - SelectOpts::REFRESH - SelectOpts::ASAP,
            nmask: info.nmask,
        };
        let frame = if info.locate {
            locate(fed, &req, None).into_frame(info.streamid)
        } else {
            select(fed, &req, None).into_frame(info.streamid)
        };
        if requester.send(frame).is_err() {
            debug!("{} vanished before resumption", requester.ident);
        }
    }
}
