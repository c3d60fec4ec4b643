// src/core/cluster/mod.rs

//! The subscriber table: admission, eviction, broadcast, and the
//! aggregate space/statistics views selection and statfs rely on.

pub mod select;

use crate::core::CmsError;
use crate::core::mask::{SMask, STMAX};
use crate::core::node::{CmsNode, StateFlags};
use crate::core::protocol::Frame;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Aggregate free-space figures for a candidate set, reported by statfs
/// as `"wNum wFreeKB wUtil sNum sFreeKB sUtil"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceData {
    pub w_num: u32,
    pub w_free_kb: u64,
    pub w_util: u32,
    pub s_num: u32,
    pub s_free_kb: u64,
    pub s_util: u32,
}

impl SpaceData {
    pub fn to_line(self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.w_num, self.w_free_kb, self.w_util, self.s_num, self.s_free_kb, self.s_util
        )
    }

    pub const UNKNOWN: &'static str = "-1 -1 -1 -1 -1 -1";
}

#[derive(Default)]
struct TableInner {
    slots: Vec<Option<Arc<CmsNode>>>,
    count: usize,
    inst_num: u64,
    sel_acnt: u64,
    sel_rcnt: u64,
}

/// Table of admitted subscribers indexed by dense subscriber id.
pub struct NodeTable {
    inner: Mutex<TableInner>,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    pub fn new() -> Self {
        NodeTable {
            inner: Mutex::new(TableInner {
                slots: (0..STMAX).map(|_| None).collect(),
                ..TableInner::default()
            }),
        }
    }

    /// Admits a peer: assigns the lowest free subscriber id and a fresh
    /// instance, then constructs the node through `make`. Fails with
    /// `Overflow` when all `STMAX` slots are taken.
    pub fn admit(
        &self,
        make: impl FnOnce(usize, u64) -> Arc<CmsNode>,
    ) -> Result<Arc<CmsNode>, CmsError> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.slots.iter().position(|s| s.is_none()) else {
            return Err(CmsError::Overflow);
        };
        inner.inst_num += 1;
        let node = make(id, inner.inst_num);
        inner.slots[id] = Some(node.clone());
        inner.count += 1;
        info!("{} admitted as subscriber {}", node.ident, id);
        Ok(node)
    }

    /// Removes the subscriber in slot `id` if its instance still matches.
    /// The caller runs the bounce pass (cache, paths, waiters) afterwards.
    pub fn remove(&self, id: usize, instance: u64) -> Option<Arc<CmsNode>> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(id)?;
        if slot.as_ref().is_some_and(|n| n.instance == instance) {
            let node = slot.take();
            inner.count -= 1;
            node
        } else {
            None
        }
    }

    /// ABA-safe borrow: the slot must still hold the same instance.
    pub fn get(&self, id: usize, instance: u64) -> Option<Arc<CmsNode>> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(id)?
            .as_ref()
            .filter(|n| n.instance == instance)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// All admitted nodes whose bit is in `mask`.
    pub fn members(&self, mask: SMask) -> Vec<Arc<CmsNode>> {
        let inner = self.inner.lock();
        mask.iter()
            .filter_map(|id| inner.slots.get(id).and_then(|s| s.clone()))
            .collect()
    }

    /// The subscriber mask for a host name, used to honor avoid-host
    /// requests.
    pub fn mask_of_host(&self, host: &str) -> SMask {
        let inner = self.inner.lock();
        let mut mask = SMask::EMPTY;
        for node in inner.slots.iter().flatten() {
            if node.host == host {
                mask |= node.mask;
            }
        }
        mask
    }

    /// Enqueues `frame` on every bound member of `mask`. Returns the
    /// peers whose link failed so the caller can evict them; a failed
    /// write is a lost link.
    pub fn broadcast(&self, mask: SMask, frame: &Frame) -> Vec<Arc<CmsNode>> {
        let mut dead = Vec::new();
        for node in self.members(mask) {
            if !node.is_bound() {
                continue;
            }
            if node.send(frame.clone()).is_err() {
                dead.push(node);
            }
        }
        dead
    }

    /// Aggregates space figures over `mask`. `rw` and `ss` are the
    /// path-capability masks bounding which members count as writable or
    /// staging candidates.
    pub fn space(&self, mask: SMask, rw: SMask, ss: SMask) -> SpaceData {
        let mut data = SpaceData::default();
        let mut w_util_sum = 0u64;
        let mut s_util_sum = 0u64;
        for node in self.members(mask) {
            if !node.is_selectable() {
                continue;
            }
            let (_, _, free_mb, util) = node.scores();
            let flags = node.flags();
            if flags.contains(StateFlags::RW) && !(node.mask & rw).is_empty() {
                data.w_num += 1;
                data.w_free_kb += free_mb * 1024;
                w_util_sum += util as u64;
            }
            if !flags.contains(StateFlags::NOSTAGE) && !(node.mask & ss).is_empty() {
                data.s_num += 1;
                data.s_free_kb += free_mb * 1024;
                s_util_sum += util as u64;
            }
        }
        if data.w_num > 0 {
            data.w_util = (w_util_sum / data.w_num as u64) as u32;
        }
        if data.s_num > 0 {
            data.s_util = (s_util_sum / data.s_num as u64) as u32;
        }
        data
    }

    /// Formats the locate listing: one `XY[addr]:port` entry per member
    /// of `mask`, upper-case for online, lower-case for pending, `M`
    /// for managers, `w` when the member can write the path.
    pub fn format_locate(&self, mask: SMask, pf: SMask, wf: SMask) -> String {
        let mut out = String::new();
        for node in self.members(mask) {
            let flags = node.flags();
            if flags.intersects(StateFlags::OFFLINE | StateFlags::DISABLE) {
                continue;
            }
            let mut kind = if node.is_manager() { 'M' } else { 'S' };
            if !(node.mask & pf).is_empty() {
                kind = kind.to_ascii_lowercase();
            }
            let access = if (node.mask & wf).is_empty() { 'r' } else { 'w' };
            if !out.is_empty() {
                out.push(' ');
            }
            out.push(kind);
            out.push(access);
            out.push_str(&node.ipv6);
        }
        out
    }

    /// One-line-per-subscriber statistics snapshot.
    pub fn stats(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for node in inner.slots.iter().flatten() {
            let (load, mass, free, util) = node.scores();
            let (tot_a, tot_r) = node.ref_totals();
            out.push_str(&format!(
                "{} id={} load={} mass={} free={}MB util={}% refA={} refR={} totA={} totR={}\n",
                node.ident,
                node.id,
                load,
                mass,
                free,
                util,
                node.ref_a(),
                node.ref_r(),
                tot_a,
                tot_r,
            ));
        }
        out
    }

    /// Clears the windowed reference counters for `mask`.
    pub fn reset_refs(&self, mask: SMask) {
        for node in self.members(mask) {
            node.reset_refs();
        }
    }

    /// Alternates the two selection pickers: true means pick by load,
    /// false by reference count. Keeping the counters balanced equalizes
    /// the pickers over time.
    pub(crate) fn next_picker(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.sel_acnt <= inner.sel_rcnt {
            inner.sel_acnt += 1;
            true
        } else {
            inner.sel_rcnt += 1;
            false
        }
    }

    /// Active/staging census over the whole table.
    pub fn census(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        let mut active = 0;
        let mut staging = 0;
        for node in inner.slots.iter().flatten() {
            if node.is_selectable() {
                active += 1;
                if !node.flags().contains(StateFlags::NOSTAGE) {
                    staging += 1;
                }
            }
        }
        (active, staging)
    }
}
