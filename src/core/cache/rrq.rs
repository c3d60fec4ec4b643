// src/core/cache/rrq.rs

//! Pending-request continuations.
//!
//! A selection that has to broadcast a `state` query does not block its
//! dispatcher: it records a `ReqInfo` keyed by path and returns a `wait`.
//! A later `have` reply resumes the waiter; the timer completes expired
//! waiters with a retry wait. Waiters reference their requester by
//! `(node id, instance)`, never by pointer; a mismatched instance means
//! the requester is gone and the waiter is dropped.

use crate::core::cluster::select::SelectOpts;
use crate::core::mask::SMask;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A suspended request awaiting a broadcast reply.
#[derive(Debug, Clone)]
pub struct ReqInfo {
    /// Requesting peer's subscriber slot.
    pub node: usize,
    /// Requesting peer's admission instance (ABA guard).
    pub instance: u64,
    pub streamid: u16,
    pub opts: SelectOpts,
    /// Subscribers the requester wants avoided.
    pub nmask: SMask,
    /// True when the waiter came from a `locate` rather than a `select`.
    pub locate: bool,
    pub expires: Instant,
}

/// Table of waiters keyed by path.
#[derive(Debug)]
pub struct WaiterTable {
    waiting: DashMap<String, Vec<ReqInfo>>,
    hold: Duration,
}

impl WaiterTable {
    pub fn new(hold: Duration) -> Self {
        WaiterTable {
            waiting: DashMap::new(),
            hold,
        }
    }

    /// Suspends a request on `path`.
    pub fn enqueue(
        &self,
        path: &str,
        node: usize,
        instance: u64,
        streamid: u16,
        opts: SelectOpts,
        nmask: SMask,
        locate: bool,
    ) {
        let info = ReqInfo {
            node,
            instance,
            streamid,
            opts,
            nmask,
            locate,
            expires: Instant::now() + self.hold,
        };
        self.waiting.entry(path.to_string()).or_default().push(info);
    }

    /// Takes every waiter suspended on `path` for resumption.
    pub fn take(&self, path: &str) -> Vec<ReqInfo> {
        self.waiting
            .remove(path)
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    /// Removes and returns every waiter past its deadline, with the path
    /// it was suspended on.
    pub fn expire(&self) -> Vec<(String, ReqInfo)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.waiting.retain(|path, waiters| {
            waiters.retain(|w| {
                if w.expires <= now {
                    expired.push((path.clone(), w.clone()));
                    false
                } else {
                    true
                }
            });
            !waiters.is_empty()
        });
        expired
    }

    /// Eviction pass for subscriber `id`: waiters issued by the evicted
    /// peer are dropped, and its bit is cleared from every remaining
    /// avoid mask.
    pub fn bounce(&self, id: usize) {
        let keep = !SMask::node(id);
        self.waiting.retain(|_, waiters| {
            waiters.retain_mut(|w| {
                if w.node == id {
                    return false;
                }
                w.nmask &= keep;
                true
            });
            !waiters.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.waiting.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
