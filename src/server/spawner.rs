// src/server/spawner.rs

//! Second startup phase: spawn every background task — the retry/expiry
//! timer, the load meter, the prepare worker, and the upstream
//! subscription loops.

use super::context::ServerContext;
use super::pander;
use crate::core::cluster::select::SelectOpts;
use crate::core::mask::SMask;
use crate::core::prepare::{self, PrepArgs, DEFAULT_ROUNDS};
use crate::core::protocol::frame::Frame;
use crate::core::protocol::request::load_frame;
use crate::core::protocol::ReqCode;
use crate::core::state::FederationState;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let fed = ctx.fed.clone();

    // The prepare worker drains the stage queue.
    let prep_rx = ctx
        .prep_rx
        .take()
        .expect("prepare receiver consumed twice");
    ctx.background_tasks.spawn(prepare::run_worker(
        fed.clone(),
        prep_rx,
        ctx.shutdown_tx.subscribe(),
    ));

    // The timer sweeps waiter deadlines, peer liveness, and the cache.
    ctx.background_tasks
        .spawn(run_timer(fed.clone(), ctx.shutdown_tx.subscribe()));

    // The meter samples local load and reports usage upstream.
    ctx.background_tasks
        .spawn(run_meter(fed.clone(), ctx.shutdown_tx.subscribe()));

    // One subscription loop per configured upstream manager.
    for target in fed.config.managers.hosts.clone() {
        ctx.background_tasks.spawn(pander::run(
            fed.clone(),
            target,
            ctx.shutdown_tx.subscribe(),
        ));
    }

    Ok(())
}

/// One-second heartbeat driving waiter expiry, the ping sweep, and the
/// periodic cache sweep.
async fn run_timer(fed: Arc<FederationState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let ping_every = fed.config.delays.ping.as_secs().max(1);
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tick.tick() => {
                ticks += 1;
                expire_waiters(&fed);
                if ticks % ping_every == 0 {
                    ping_sweep(&fed);
                }
                if ticks % 60 == 0 {
                    fed.cache.sweep();
                }
            }
        }
    }
}

/// Completes every waiter past its deadline with a bounded retry. A
/// broadcast that produced zero replies over a staging-capable set also
/// queues a stage-in, and the waiter is held for the stage interval.
fn expire_waiters(fed: &Arc<FederationState>) {
    for (path, info) in fed.rrq.expire() {
        let Some(requester) = fed.table.get(info.node, info.instance) else {
            continue;
        };
        let nothing_known = fed
            .cache
            .peek(&path)
            .map(|loc| (loc.hf | loc.pf).is_empty())
            .unwrap_or(true);
        let stageable = fed
            .paths
            .find(&path)
            .map(|p| !p.ssvec.is_empty())
            .unwrap_or(false);

        let secs = if nothing_known && stageable && !info.opts.contains(SelectOpts::ONLINE) {
            debug!("queueing stage-in for unanswered {}", path);
            fed.prepq.add(PrepArgs {
                reqid: fed.next_auto_reqid(),
                notify: String::new(),
                prty: "0".to_string(),
                mode: String::new(),
                path: path.clone(),
                write: info.opts.contains(SelectOpts::WRITE),
                rounds: DEFAULT_ROUNDS,
            });
            fed.config.delays.stage.as_secs() as u32
        } else {
            fed.config.delays.retry.as_secs() as u32
        };
        let _ = requester.send(Frame::wait(info.streamid, secs));
    }
}

/// Decrements every peer's ping-pong credit; a peer that never answered
/// the previous ping is evicted, everyone else is pinged again.
fn ping_sweep(fed: &Arc<FederationState>) {
    let peers = fed
        .table
        .members(SMask::FULL)
        .into_iter()
        .chain(fed.managers.members());
    for node in peers {
        let credit = node.with_state(|st| {
            st.ping_pong -= 1;
            st.ping_pong
        });
        if credit < 0 {
            fed.evict(&node, "ping timeout");
        } else if node.send(Frame::bare(ReqCode::Ping, 0, 0)).is_err() {
            fed.evict(&node, "ping write failed");
        }
    }
}

/// Samples the local machine on the perf interval, reports usage to the
/// managers, and rewinds the windowed reference counters.
async fn run_meter(fed: Arc<FederationState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(fed.config.delays.perf);
    let mut sys = System::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tick.tick() => {
                let sample = fed.meter.sample_local(&mut sys);
                if fed.managers.present() {
                    let (_, max_free) = fed.meter.free_space();
                    fed.managers.inform(&load_frame(0, sample.to_wire(), max_free.into()));
                }
                fed.table.reset_refs(SMask::FULL);
            }
        }
    }
    info!("meter task stopped");
}
