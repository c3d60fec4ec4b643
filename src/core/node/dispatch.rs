// src/core/node/dispatch.rs

//! Per-peer request dispatch: decodes the envelope and runs the matching
//! `do_*` operation against local state, forwarding or back-propagating
//! where the role demands it.

use crate::config::ManagerAddr;
use crate::core::CmsError;
use crate::core::cluster::select::{
    self, LocateOutcome, SelectOpts, SelectRequest, WaiterKey,
};
use crate::core::meter::LoadSample;
use crate::core::node::fsops::{self, FsOp};
use crate::core::node::{CmsNode, StateFlags};
use crate::core::policy::{PolicyCaps, PolicyRequest, PolicyVerdict};
use crate::core::prepare::{DEFAULT_ROUNDS, PrepArgs};
use crate::core::protocol::codes::{
    HaveMod, LocateMod, PrepMod, SelectMod, StateMod, StatsMod, StatusMod,
};
use crate::core::protocol::frame::Frame;
use crate::core::protocol::request::{RRData, load_frame, path_frame};
use crate::core::protocol::ReqCode;
use crate::core::state::FederationState;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routes decoded requests from one peer against the shared services.
pub struct Dispatcher {
    fed: Arc<FederationState>,
}

impl Dispatcher {
    pub fn new(fed: Arc<FederationState>) -> Self {
        Dispatcher { fed }
    }

    /// Dispatches one frame. `TransportLost`/`PeerEvicted` errors are
    /// returned to the link loop (they end the connection); anything
    /// else is converted to a wire error reply here.
    pub async fn route(&self, node: &Arc<CmsNode>, frame: Frame) -> Result<(), CmsError> {
        let arg = match RRData::decode(&frame) {
            Ok(arg) => arg,
            Err(e) => {
                warn!("{} sent an undecodable {}: {}", node.ident, frame.code, e);
                return node.send(Frame::error(frame.streamid, e.wire_errno(), &e.to_string()));
            }
        };

        let result = match frame.code {
            ReqCode::Ping => self.do_ping(node, &arg),
            ReqCode::Pong => self.do_pong(node),
            ReqCode::Load => self.do_load(node, &arg),
            ReqCode::Space => self.do_space(node, &arg),
            ReqCode::Avail => self.do_avail(node, &arg),
            ReqCode::Status => self.do_status(node, &arg),
            ReqCode::Try => self.do_try(node, &arg),
            ReqCode::Disc => self.do_disc(node),
            ReqCode::Have => self.do_have(node, &arg, &frame),
            ReqCode::Gone => self.do_gone(node, &arg, &frame),
            ReqCode::State => self.do_state(node, &arg).await,
            ReqCode::StatFs => self.do_statfs(node, &arg),
            ReqCode::Locate => self.do_locate(node, &arg).await,
            ReqCode::Select => self.do_select(node, &arg).await,
            ReqCode::PrepAdd => self.do_prep_add(node, &arg).await,
            ReqCode::PrepDel => self.do_prep_del(node, &arg).await,
            ReqCode::Chmod => self.do_mutation(node, &arg, &frame, FsOp::Chmod).await,
            ReqCode::Mkdir => self.do_mutation(node, &arg, &frame, FsOp::Mkdir).await,
            ReqCode::Mkpath => self.do_mutation(node, &arg, &frame, FsOp::Mkpath).await,
            ReqCode::Mv => self.do_mutation(node, &arg, &frame, FsOp::Mv).await,
            ReqCode::Rm => self.do_mutation(node, &arg, &frame, FsOp::Rm).await,
            ReqCode::Rmdir => self.do_mutation(node, &arg, &frame, FsOp::Rmdir).await,
            ReqCode::Update => self.do_update(node, &arg),
            ReqCode::Usage => self.do_usage(node, &arg),
            ReqCode::Stats => self.do_stats(node, &arg),
            ReqCode::Login => Err(CmsError::BadRequest("duplicate login".to_string())),
            // Response codes arriving here are stray; drop them.
            ReqCode::Wait | ReqCode::Error | ReqCode::Redirect | ReqCode::Data => {
                debug!("{} sent stray response code {}", node.ident, frame.code);
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e @ (CmsError::TransportLost(_) | CmsError::PeerEvicted(_))) => Err(e),
            Err(e) => {
                warn!("{} {} failed: {}", node.ident, frame.code, e);
                node.send(Frame::error(frame.streamid, e.wire_errno(), &e.to_string()))
            }
        }
    }

    /// Offers the request to the policy hook; true means it was claimed
    /// and the built-in handling must be skipped.
    async fn policy_claims(&self, cap: PolicyCaps, arg: &RRData) -> bool {
        let Some(hook) = &self.fed.policy else {
            return false;
        };
        if !hook.caps().contains(cap) {
            return false;
        }
        let req = PolicyRequest {
            cap,
            streamid: arg.streamid,
            path: &arg.path,
            path2: (!arg.path2.is_empty()).then_some(arg.path2.as_str()),
            mode: (!arg.mode.is_empty()).then_some(arg.mode.as_str()),
            opaque: &arg.opaque,
        };
        hook.claim(req).await == PolicyVerdict::Claimed
    }

    // --- liveness ---

    fn do_ping(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        node.with_state(|st| st.ping_pong = 2);
        node.send(Frame::bare(ReqCode::Pong, arg.streamid, 0))
    }

    fn do_pong(&self, node: &Arc<CmsNode>) -> Result<(), CmsError> {
        node.with_state(|st| st.ping_pong = 2);
        Ok(())
    }

    // --- load & space ---

    /// Responses to usage requests are local to the cell; a manager also
    /// folds them into its cell average and may announce new space
    /// upstream once free space first crosses the threshold.
    fn do_load(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let fed = &self.fed;
        let sample = LoadSample::from_wire(arg.loads);
        let load = fed.meter.calc_load(&sample);
        let mass = fed.meter.calc_mass(load, sample.dsk);

        let log_now = node.with_state(|st| {
            st.load = load;
            st.mass = mass;
            st.disk_free = arg.dsk_free;
            st.disk_util = sample.dsk as u32;
            st.ping_pong = 2;
            if fed.config.log_perf > 0 {
                if st.logload == 0 {
                    st.logload = fed.config.log_perf;
                    true
                } else {
                    st.logload -= 1;
                    false
                }
            } else {
                false
            }
        });

        if fed.config.as_manager() {
            fed.meter.record(sample);
            let is_rw = node.flags().contains(StateFlags::RW);
            if is_rw && arg.dsk_free != fed.meter.last_free() {
                let old = fed.meter.raise_last_free(arg.dsk_free);
                if old == 0 && arg.dsk_free >= fed.config.disk.min_mb {
                    self.announce_space(arg.dsk_free, sample.dsk as u32);
                }
            }
        }

        if log_now {
            info!(
                "{} load={} cpu={} net={} xeq={} mem={} pag={} dsk={}% free={}MB",
                node.ident,
                load,
                sample.cpu,
                sample.net,
                sample.xeq,
                sample.mem,
                sample.pag,
                sample.dsk,
                arg.dsk_free
            );
        }
        Ok(())
    }

    /// A space request asks us to report free space to the requester.
    fn do_space(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let (max_free, util) = self.fed.meter.free_space();
        debug!("{} asked for space: {}MB free {}% util", node.ident, max_free, util);
        node.send(crate::core::protocol::request::avail_frame(
            arg.streamid,
            max_free,
            util,
        ))
    }

    /// One-shot upstream space announcement carrying the figures that
    /// raised the watermark.
    fn announce_space(&self, free_mb: u64, util: u32) {
        self.fed
            .managers
            .inform(&crate::core::protocol::request::avail_frame(0, free_mb, util));
    }

    /// A peer's free-space figure; local to the cell, never propagated.
    fn do_avail(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        node.update_space(arg.dsk_free, arg.dsk_util);
        debug!("{} {}MB free; {}% util", node.ident, arg.dsk_free, arg.dsk_util);
        Ok(())
    }

    // --- presence advisories ---

    /// A have advisory is recorded and back-propagated when it changed
    /// our view and we are subscribed upstream.
    fn do_have(&self, node: &Arc<CmsNode>, arg: &RRData, frame: &Frame) -> Result<(), CmsError> {
        let fed = &self.fed;
        let pending = HaveMod::from_bits_truncate(arg.modifier).contains(HaveMod::PENDING);
        debug!(
            "{} have {}{}",
            node.ident,
            if pending { "P " } else { "" },
            arg.path
        );

        let isnew = if fed.config.as_manager() {
            fed.cache.add_file(&arg.path, node.mask, pending)
        } else {
            true
        };

        // A positive reply may complete suspended selections on the path.
        select::resume_waiters(fed, &arg.path);

        if fed.managers.present() && isnew {
            fed.managers.inform(frame);
        }
        Ok(())
    }

    /// A gone advisory clears presence; staging nodes also purge any
    /// matching prepare entries.
    fn do_gone(&self, node: &Arc<CmsNode>, arg: &RRData, frame: &Frame) -> Result<(), CmsError> {
        let fed = &self.fed;
        debug!("{} gone {}", node.ident, arg.path);

        let isnew = if fed.config.as_manager() {
            fed.cache.del_file(&arg.path, node.mask)
        } else {
            if fed.config.disk_ss() {
                fed.prepq.gone(&arg.path);
            }
            true
        };

        if fed.managers.present() && isnew {
            fed.managers.inform(frame);
        }
        Ok(())
    }

    // --- state queries ---

    /// A state query from upstream: managers consult the cache and
    /// rebroadcast to the uncertain subset; data servers stat the disk.
    /// The reply, when owed, is a have with Online or Pending.
    async fn do_state(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let fed = &self.fed;
        node.with_state(|st| st.flags |= StateFlags::KNOWN);
        debug!("{} state {}", node.ident, arg.path);

        let reply = if fed.config.as_manager() {
            self.do_state_fwd(arg)
        } else if fed.config.disk_ok() {
            if fsops::is_online(&fed.config.fs, &arg.path).await {
                HaveMod::ONLINE
            } else if fed.config.disk_ss() && fed.prepq.exists(&arg.path) {
                HaveMod::PENDING
            } else {
                HaveMod::empty()
            }
        } else {
            return Ok(());
        };

        if reply.is_empty() {
            return Ok(());
        }
        node.send(path_frame(
            ReqCode::Have,
            arg.streamid,
            reply.bits(),
            &arg.path,
        ))
    }

    /// Manager-side state forwarding: answer from the cache when
    /// possible, rebroadcast to whoever has not answered yet.
    fn do_state_fwd(&self, arg: &RRData) -> HaveMod {
        let fed = &self.fed;
        let Some(pinfo) = fed.paths.find(&arg.path) else {
            debug!("path find failed for state {}", arg.path);
            return HaveMod::empty();
        };
        if pinfo.rovec.is_empty() {
            return HaveMod::empty();
        }

        // A refresh bypasses the cache entirely: requery everyone and
        // answer nothing until the replies come back.
        let refresh = StateMod::from_bits_truncate(arg.modifier).contains(StateMod::REFRESH);
        if refresh {
            let query = path_frame(ReqCode::State, 0, arg.modifier, &arg.path);
            fed.broadcast(pinfo.rovec, &query);
            fed.cache.mark_broadcast(&arg.path, pinfo.rovec);
            return HaveMod::empty();
        }

        let loc = fed.cache.get_file(&arg.path, pinfo.rovec);
        let ask = if loc.hit { loc.bf } else { pinfo.rovec };
        if !ask.is_empty() {
            let query = path_frame(ReqCode::State, 0, arg.modifier, &arg.path);
            fed.broadcast(ask, &query);
            fed.cache.mark_broadcast(&arg.path, ask);
        }

        if !loc.hf.is_empty() {
            HaveMod::ONLINE
        } else if !loc.pf.is_empty() {
            HaveMod::PENDING
        } else {
            HaveMod::empty()
        }
    }

    /// Aggregated space for the path's serving set.
    fn do_statfs(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let fed = &self.fed;
        let line = match fed.paths.find(&arg.path) {
            Some(pinfo) if !pinfo.rovec.is_empty() => {
                fed.table
                    .space(pinfo.rovec, pinfo.rwvec, pinfo.ssvec)
                    .to_line()
            }
            _ => crate::core::cluster::SpaceData::UNKNOWN.to_string(),
        };
        node.send(Frame::data(arg.streamid, 0, line.as_bytes()))
    }

    // --- read-path selection ---

    async fn do_locate(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        if self.policy_claims(PolicyCaps::SELECT, arg).await {
            return Ok(());
        }
        let mods = LocateMod::from_bits_truncate(arg.modifier);
        let mut opts = SelectOpts::empty();
        if mods.contains(LocateMod::REFRESH) {
            opts |= SelectOpts::REFRESH;
        }
        let waiter = mods.contains(LocateMod::ASAP).then_some(WaiterKey {
            node: node.id,
            instance: node.instance,
            streamid: arg.streamid,
        });
        debug!("{} locate {}", node.ident, arg.path);

        let req = SelectRequest::new(arg.path.clone(), opts);
        let outcome = select::locate(&self.fed, &req, waiter);
        if let LocateOutcome::Error(e) = &outcome {
            debug!("{} locate {} miss: {}", node.ident, arg.path, e);
        }
        node.send(outcome.into_frame(arg.streamid))
    }

    async fn do_select(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let mods = SelectMod::from_bits_truncate(arg.modifier);
        let cap = if mods.contains(SelectMod::STAT) {
            PolicyCaps::STAT
        } else {
            PolicyCaps::SELECT
        };
        if self.policy_claims(cap, arg).await {
            return Ok(());
        }

        let mut opts = SelectOpts::PEERS;
        if mods.contains(SelectMod::REFRESH) {
            opts |= SelectOpts::REFRESH;
        }
        if mods.contains(SelectMod::ONLINE) {
            opts |= SelectOpts::ONLINE;
        }
        if mods.contains(SelectMod::STAT) {
            opts |= SelectOpts::NOBIND;
        } else {
            if mods.contains(SelectMod::TRUNC) {
                opts |= SelectOpts::WRITE | SelectOpts::TRUNC;
            }
            if mods.contains(SelectMod::WRITE) {
                opts |= SelectOpts::WRITE;
            }
            if mods.contains(SelectMod::CREATE) {
                opts |= SelectOpts::WRITE | SelectOpts::NEWFILE;
            }
        }

        let mut req = SelectRequest::new(arg.path.clone(), opts);

        // An avoid host makes the request ineligible for async redirect.
        let waiter = match &arg.avoid {
            Some(host) => {
                req.nmask = self.fed.table.mask_of_host(host);
                None
            }
            None => mods.contains(SelectMod::ASAP).then_some(WaiterKey {
                node: node.id,
                instance: node.instance,
                streamid: arg.streamid,
            }),
        };
        debug!("{} select {:?} {}", node.ident, mods, arg.path);

        let outcome = select::select(&self.fed, &req, waiter);
        node.send(outcome.into_frame(arg.streamid))
    }

    // --- prepare ---

    async fn do_prep_add(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        if self.policy_claims(PolicyCaps::PREP, arg).await {
            return Ok(());
        }
        let mods = PrepMod::from_bits_truncate(arg.modifier);
        debug!(
            "{} prepadd {} {} {}",
            node.ident, arg.reqid, arg.prty, arg.path
        );
        self.fed.prepq.add(PrepArgs {
            reqid: arg.reqid.clone(),
            notify: arg.notify.clone(),
            prty: arg.prty.clone(),
            mode: arg.mode.clone(),
            path: arg.path.clone(),
            write: mods.contains(PrepMod::WRITE),
            rounds: DEFAULT_ROUNDS,
        });
        Ok(())
    }

    async fn do_prep_del(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        if self.policy_claims(PolicyCaps::PREP, arg).await {
            return Ok(());
        }
        if self.fed.prepq.del(&arg.reqid) {
            debug!("{} canceled prepare {}", node.ident, arg.reqid);
        } else {
            debug!("{} ignoring cancel prepare {}", node.ident, arg.reqid);
        }
        Ok(())
    }

    // --- write-path mutations ---

    /// Mutations fan out to every capable subscriber on routing roles and
    /// run locally on data roles. Roles with no disk answer ok.
    async fn do_mutation(
        &self,
        node: &Arc<CmsNode>,
        arg: &RRData,
        frame: &Frame,
        op: FsOp,
    ) -> Result<(), CmsError> {
        let cap = match op {
            FsOp::Chmod => PolicyCaps::CHMOD,
            FsOp::Mkdir => PolicyCaps::MKDIR,
            FsOp::Mkpath => PolicyCaps::MKPATH,
            FsOp::Mv => PolicyCaps::MV,
            FsOp::Rm => PolicyCaps::RM,
            FsOp::Rmdir => PolicyCaps::RMDIR,
        };
        if self.policy_claims(cap, arg).await {
            return Ok(());
        }

        let fed = &self.fed;
        if matches!(op, FsOp::Chmod | FsOp::Mkdir | FsOp::Mkpath)
            && fsops::parse_mode(&arg.mode).is_none()
        {
            return Err(CmsError::BadRequest("invalid mode".to_string()));
        }

        if fed.config.as_manager() {
            if let Some(pinfo) = fed.paths.find(&arg.path) {
                debug!("{} forwarding {:?} {} to {}", node.ident, op, arg.path, pinfo.rovec);
                fed.broadcast(pinfo.rovec, frame);
            }
            return Ok(());
        }
        if !fed.config.disk_ok() {
            return Ok(());
        }

        let mode = (!arg.mode.is_empty()).then_some(arg.mode.as_str());
        let path2 = (!arg.path2.is_empty()).then_some(arg.path2.as_str());
        fsops::run(&fed.config.fs, op, mode, &arg.path, path2).await
    }

    // --- control ---

    /// Status changes: reset, stage/nostage, suspend/resume. Aggregate
    /// count edges are announced upstream by `sync_state`.
    fn do_status(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let fed = &self.fed;
        let mods = StatusMod::from_bits_truncate(arg.modifier);

        if mods.contains(StatusMod::RESET) {
            // Propagate the reset upward, then drop every cache line the
            // sender contributed.
            fed.managers.reset();
            fed.cache.bounce(node.mask);
        }

        let mut srv_msg = None;
        let mut stg_msg = None;
        node.with_state(|st| {
            if mods.contains(StatusMod::NOSTAGE) && !st.flags.contains(StateFlags::NOSTAGE) {
                st.flags |= StateFlags::NOSTAGE;
                stg_msg = Some("staging suspended");
            } else if mods.contains(StatusMod::STAGE) && st.flags.contains(StateFlags::NOSTAGE) {
                st.flags -= StateFlags::NOSTAGE;
                stg_msg = Some("staging resumed");
            }
            if mods.contains(StatusMod::SUSPEND) && !st.flags.contains(StateFlags::SUSPEND) {
                st.flags |= StateFlags::SUSPEND;
                srv_msg = Some("service suspended");
            } else if mods.contains(StatusMod::RESUME) && st.flags.contains(StateFlags::SUSPEND) {
                st.flags -= StateFlags::SUSPEND;
                srv_msg = Some("service resumed");
            }
        });

        if srv_msg.is_some() || stg_msg.is_some() {
            info!(
                "{} {} {}",
                node.ident,
                srv_msg.unwrap_or(""),
                stg_msg.unwrap_or("")
            );
            fed.sync_state();
        }
        Ok(())
    }

    /// We are being displaced: adopt the supplied alternates and drop
    /// this manager link so the subscription logic can rebind.
    fn do_try(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let default_port = self.fed.config.port;
        let alts: Vec<ManagerAddr> = arg
            .hosts
            .iter()
            .map(|h| match h.rsplit_once(':') {
                Some((host, port)) => ManagerAddr {
                    host: host.to_string(),
                    port: port.parse().unwrap_or(default_port),
                },
                None => ManagerAddr {
                    host: h.clone(),
                    port: default_port,
                },
            })
            .collect();
        info!("{} redirecting us to {:?}", node.ident, alts);
        *self.fed.alternates.lock() = alts;
        Err(CmsError::PeerEvicted("redirected".to_string()))
    }

    /// A disc request; managers echo it before the teardown.
    fn do_disc(&self, node: &Arc<CmsNode>) -> Result<(), CmsError> {
        info!("{} requested a disconnect", node.ident);
        if self.fed.config.as_manager() {
            let _ = node.send(Frame::bare(ReqCode::Disc, 0, 0));
        }
        Err(CmsError::PeerEvicted("disc requested".to_string()))
    }

    fn do_update(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        node.send(Frame::bare(
            ReqCode::Status,
            arg.streamid,
            self.fed.cms.status_modifier(),
        ))
    }

    fn do_usage(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let (sample, max_free) = self.fed.meter.report();
        node.send(load_frame(arg.streamid, sample.to_wire(), max_free))
    }

    fn do_stats(&self, node: &Arc<CmsNode>, arg: &RRData) -> Result<(), CmsError> {
        let mods = StatsMod::from_bits_truncate(arg.modifier);
        let text = self.fed.stats_snapshot();
        if mods.contains(StatsMod::SIZE) {
            return node.send(Frame::data(arg.streamid, text.len() as u32, b""));
        }
        node.send(Frame::data(arg.streamid, text.len() as u32, text.as_bytes()))
    }
}
