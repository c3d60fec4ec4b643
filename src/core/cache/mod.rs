// src/core/cache/mod.rs

//! The path-indexed file location cache.
//!
//! The cache is advisory: lookups may be stale, `have`/`gone` advisories
//! refresh it, and a miss records which subscribers still need to be asked
//! (the `bf` broadcast mask). Writes go through the sharded map's
//! per-bucket locks.

pub mod paths;
pub mod rrq;

use crate::config::CacheConfig;
use crate::core::mask::SMask;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Presence state for one known path. A subscriber bit is in `hf` (has
/// the file), `pf` (has it pending stage-in), or neither, never both.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub hf: SMask,
    pub pf: SMask,
    pub bf: SMask,
    fresh: Instant,
}

impl CacheEntry {
    fn new() -> Self {
        CacheEntry {
            hf: SMask::EMPTY,
            pf: SMask::EMPTY,
            bf: SMask::EMPTY,
            fresh: Instant::now(),
        }
    }
}

/// The result of a cache lookup, restricted to the caller's candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileLoc {
    /// False when the path had no entry (a broadcast is needed).
    pub hit: bool,
    pub hf: SMask,
    pub pf: SMask,
    pub bf: SMask,
}

/// Path → presence-mask cache with advisory add/delete and bounce
/// invalidation.
#[derive(Debug)]
pub struct LocationCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl LocationCache {
    pub fn new(cfg: &CacheConfig) -> Self {
        LocationCache {
            entries: DashMap::new(),
            ttl: cfg.ttl,
            max_entries: cfg.max_entries,
        }
    }

    /// Records a `have` advisory: ORs `mask` into `hf` (or `pf` when the
    /// file is pending stage-in) and refreshes the entry. Returns true if
    /// the presence bits changed, which gates upstream propagation.
    pub fn add_file(&self, path: &str, mask: SMask, pending: bool) -> bool {
        let mut entry = self
            .entries
            .entry(path.to_string())
            .or_insert_with(CacheEntry::new);
        let before = (entry.hf, entry.pf);
        if pending {
            entry.pf |= mask;
            entry.hf &= !mask;
        } else {
            entry.hf |= mask;
            entry.pf &= !mask;
        }
        entry.bf &= !mask;
        entry.fresh = Instant::now();
        (entry.hf, entry.pf) != before
    }

    /// Records a `gone` advisory: clears `mask` from both presence masks.
    /// Returns true if no subscriber has the file any longer, which
    /// triggers an upstream `gone`.
    pub fn del_file(&self, path: &str, mask: SMask) -> bool {
        let Some(mut entry) = self.entries.get_mut(path) else {
            return false;
        };
        let had = !(entry.hf | entry.pf).is_empty();
        entry.hf &= !mask;
        entry.pf &= !mask;
        entry.fresh = Instant::now();
        had && (entry.hf | entry.pf).is_empty()
    }

    /// Looks up `path`, restricting the answer to `candidates`. On a miss
    /// the entry is created with `bf = candidates`, signalling that a
    /// broadcast query is needed.
    pub fn get_file(&self, path: &str, candidates: SMask) -> FileLoc {
        if let Some(entry) = self.entries.get(path) {
            return FileLoc {
                hit: true,
                hf: entry.hf & candidates,
                pf: entry.pf & candidates,
                bf: entry.bf & candidates,
            };
        }
        let mut entry = self
            .entries
            .entry(path.to_string())
            .or_insert_with(CacheEntry::new);
        entry.bf |= candidates;
        FileLoc {
            hit: false,
            hf: SMask::EMPTY,
            pf: SMask::EMPTY,
            bf: entry.bf,
        }
    }

    /// Read-only view of a path's presence masks; never creates an entry.
    pub fn peek(&self, path: &str) -> Option<FileLoc> {
        self.entries.get(path).map(|entry| FileLoc {
            hit: true,
            hf: entry.hf,
            pf: entry.pf,
            bf: entry.bf,
        })
    }

    /// Marks the candidates of an in-flight broadcast so a subsequent
    /// lookup does not re-broadcast to them.
    pub fn mark_broadcast(&self, path: &str, mask: SMask) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.bf &= !mask;
        }
    }

    /// Clears `mask` bits from every entry's hf/pf/bf; entries that become
    /// fully empty are invalidated. Used on eviction and upstream reset.
    pub fn bounce(&self, mask: SMask) {
        let keep = !mask;
        self.entries.retain(|_, entry| {
            entry.hf &= keep;
            entry.pf &= keep;
            entry.bf &= keep;
            !(entry.hf | entry.pf | entry.bf).is_empty()
        });
    }

    /// Reclaims stale entries and, when over capacity, the oldest ones.
    /// Run from the timer task.
    pub fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now.duration_since(entry.fresh) < ttl);

        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess > 0 {
            let mut ages: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().fresh))
                .collect();
            ages.sort_by_key(|(_, fresh)| *fresh);
            for (path, _) in ages.into_iter().take(excess) {
                self.entries.remove(&path);
            }
            debug!("location cache trimmed {} entries over capacity", excess);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
