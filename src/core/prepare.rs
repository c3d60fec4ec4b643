// src/core/prepare.rs

//! The prepare (stage-in) queue: asynchronous jobs that bring a file onto
//! disk. A manager's worker re-runs a deferred selection and hands the
//! stage to the chosen subscriber; a data server tracks its own pending
//! stage-ins so state queries can answer Pending.

use crate::core::cluster::select::{self, Choice, SelectOpts, SelectRequest};
use crate::core::protocol::ReqCode;
use crate::core::protocol::codes::{HaveMod, PrepMod};
use crate::core::protocol::request::{path_frame, prep_add_frame};
use crate::core::state::FederationState;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Default number of wait-and-retry rounds a queued stage survives.
pub const DEFAULT_ROUNDS: u32 = 10;

/// One queued stage request.
#[derive(Debug, Clone)]
pub struct PrepArgs {
    pub reqid: String,
    pub notify: String,
    pub prty: String,
    pub mode: String,
    pub path: String,
    pub write: bool,
    /// Remaining wait-and-retry rounds before the job is dropped.
    pub rounds: u32,
}

/// The queue half visible to dispatch: enqueue, cancel, purge, and the
/// pending-path view used by online checks.
#[derive(Debug)]
pub struct PrepQueue {
    tx: mpsc::UnboundedSender<PrepArgs>,
    pending: DashMap<String, PrepArgs>,
}

impl PrepQueue {
    /// Creates the queue and the worker's receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PrepArgs>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PrepQueue {
                tx,
                pending: DashMap::new(),
            },
            rx,
        )
    }

    /// Queues a stage request for async processing.
    pub fn add(&self, args: PrepArgs) {
        self.pending.insert(args.reqid.clone(), args.clone());
        let _ = self.tx.send(args);
    }

    /// Requeues a deferred job for another selection round.
    pub fn requeue(&self, args: PrepArgs) {
        if self.pending.contains_key(&args.reqid) {
            let _ = self.tx.send(args);
        }
    }

    /// Cancels a stage request. Returns true if it was still pending.
    pub fn del(&self, reqid: &str) -> bool {
        self.pending.remove(reqid).is_some()
    }

    /// True when a stage for `path` is still pending; state queries
    /// answer Pending for such paths.
    pub fn exists(&self, path: &str) -> bool {
        self.pending.iter().any(|e| e.value().path == path)
    }

    /// Purges every pending stage for `path`; called when the file is
    /// reported gone.
    pub fn gone(&self, path: &str) {
        self.pending.retain(|_, args| args.path != path);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True when the job has not been cancelled since it was queued.
    pub fn live(&self, reqid: &str) -> bool {
        self.pending.contains_key(reqid)
    }

    /// Marks a job complete.
    pub fn done(&self, reqid: &str) {
        self.pending.remove(reqid);
    }
}

/// The prepare worker: drains the queue, re-running a deferred selection
/// for each job and handing the stage to the chosen subscriber. Jobs
/// that can only wait are retried after the stage interval for a bounded
/// number of rounds.
pub async fn run_worker(
    fed: Arc<FederationState>,
    mut rx: mpsc::UnboundedReceiver<PrepArgs>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            job = rx.recv() => {
                let Some(args) = job else { break };
                handle(&fed, args).await;
            }
        }
    }
}

async fn handle(fed: &Arc<FederationState>, mut args: PrepArgs) {
    if !fed.prepq.live(&args.reqid) {
        debug!("prepare {} was cancelled before selection", args.reqid);
        return;
    }

    if !fed.config.as_manager() {
        // A data server tracks the stage as pending and advises upstream;
        // the entry clears when the file arrives or is reported gone.
        fed.managers
            .inform(&path_frame(ReqCode::Have, 0, HaveMod::PENDING.bits(), &args.path));
        return;
    }

    let mut opts = SelectOpts::DEFER | SelectOpts::PENDING;
    if args.write {
        opts |= SelectOpts::WRITE;
    }
    let req = SelectRequest::new(args.path.clone(), opts);

    match select::choose(fed, &req, None) {
        Choice::Node(node) => {
            let mut modifier = PrepMod::STAGE;
            if args.write {
                modifier |= PrepMod::WRITE;
            }
            let frame = prep_add_frame(
                0,
                modifier.bits(),
                &args.reqid,
                &args.notify,
                &args.prty,
                &args.mode,
                &args.path,
            );
            if node.send(frame).is_ok() {
                info!("prepare {} staged to {}", args.reqid, node.ident);
                fed.prepq.done(&args.reqid);
            } else {
                warn!("{} unreachable for prepare {}", node.ident, args.reqid);
                requeue_later(fed, args);
            }
        }
        Choice::Wait(secs) => {
            debug!("prepare {} delayed {} seconds", args.reqid, secs);
            if args.rounds == 0 {
                warn!("prepare {} unavailable: {}", args.reqid, args.path);
                fed.prepq.done(&args.reqid);
                return;
            }
            args.rounds -= 1;
            let fed = fed.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs as u64)).await;
                fed.prepq.requeue(args);
            });
        }
        Choice::Error(e) => {
            warn!("prepare {} failed for {}: {}", args.reqid, args.path, e);
            fed.prepq.done(&args.reqid);
        }
    }
}

fn requeue_later(fed: &Arc<FederationState>, args: PrepArgs) {
    let fed = fed.clone();
    tokio::spawn(async move {
        tokio::time::sleep(fed.config.delays.retry).await;
        fed.prepq.requeue(args);
    });
}
