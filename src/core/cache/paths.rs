// src/core/cache/paths.rs

//! The path-capability index: longest-prefix mapping from an exported path
//! to the subscriber masks that can serve it read-only, read-write, or
//! stage it in.

use crate::core::mask::SMask;
use parking_lot::RwLock;

/// Capability masks for one path prefix. `rwvec` and `ssvec` are always
/// subsets of `rovec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathInfo {
    pub rovec: SMask,
    pub rwvec: SMask,
    pub ssvec: SMask,
}

#[derive(Debug)]
struct PathEntry {
    prefix: String,
    info: PathInfo,
}

/// Prefix table populated as subscribers declare exports at login.
/// Lookup is longest-prefix; eviction clears the subscriber's bit from
/// every entry.
#[derive(Debug, Default)]
pub struct PathIndex {
    entries: RwLock<Vec<PathEntry>>,
}

impl PathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that subscriber `id` exports `prefix`. Write or stage
    /// capability implies read capability.
    pub fn add(&self, prefix: &str, id: usize, write: bool, stage: bool) -> SMask {
        let mut entries = self.entries.write();
        let entry = match entries.iter_mut().find(|e| e.prefix == prefix) {
            Some(e) => e,
            None => {
                // Keep longest prefixes first so lookup can take the first hit.
                let pos = entries
                    .iter()
                    .position(|e| e.prefix.len() < prefix.len())
                    .unwrap_or(entries.len());
                entries.insert(
                    pos,
                    PathEntry {
                        prefix: prefix.to_string(),
                        info: PathInfo::default(),
                    },
                );
                &mut entries[pos]
            }
        };
        entry.info.rovec.insert(id);
        if write {
            entry.info.rwvec.insert(id);
        }
        if stage {
            entry.info.ssvec.insert(id);
        }
        entry.info.rovec
    }

    /// Longest-prefix lookup for `path`.
    pub fn find(&self, path: &str) -> Option<PathInfo> {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|e| is_prefix_of(&e.prefix, path))
            .map(|e| e.info)
    }

    /// Clears the bits in `mask` from every entry; entries whose rovec
    /// empties out are dropped.
    pub fn remove_mask(&self, mask: SMask) {
        let keep = !mask;
        let mut entries = self.entries.write();
        for e in entries.iter_mut() {
            e.info.rovec &= keep;
            e.info.rwvec &= keep;
            e.info.ssvec &= keep;
        }
        entries.retain(|e| !e.info.rovec.is_empty());
    }

    /// Union of every rovec: all subscribers exporting anything.
    pub fn all_servers(&self) -> SMask {
        let entries = self.entries.read();
        entries
            .iter()
            .fold(SMask::EMPTY, |acc, e| acc | e.info.rovec)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Path-component-aware prefix test: "/a" covers "/a" and "/a/x" but
/// not "/ab".
fn is_prefix_of(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}
