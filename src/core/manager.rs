// src/core/manager.rs

//! The upstream manager set: the links this node holds toward the
//! managers it subscribes to, and the `inform` back-propagation path for
//! have/gone/status advisories.

use crate::core::CmsError;
use crate::core::mask::MTMAX;
use crate::core::node::CmsNode;
use crate::core::protocol::codes::StatusMod;
use crate::core::protocol::{Frame, ReqCode};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct ManagerLink {
    node: Arc<CmsNode>,
    /// Recently transmitted payload hashes for deduplication.
    recent: Vec<(u64, Instant)>,
}

/// Table of upstream manager links. Per-destination FIFO is preserved by
/// each link's own frame queue; identical payloads within the dedup
/// window are suppressed per destination.
pub struct ManagerSet {
    links: Mutex<Vec<ManagerLink>>,
    window: Duration,
    instances: AtomicU64,
}

impl ManagerSet {
    pub fn new(window: Duration) -> Self {
        ManagerSet {
            links: Mutex::new(Vec::new()),
            window,
            instances: AtomicU64::new(0),
        }
    }

    /// Instance numbers for manager-link node objects; disjoint from the
    /// subscriber table's space because manager links hold no slot.
    pub fn next_instance(&self) -> u64 {
        self.instances.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(&self, node: Arc<CmsNode>) -> Result<(), CmsError> {
        let mut links = self.links.lock();
        if links.len() >= MTMAX {
            return Err(CmsError::Overflow);
        }
        links.push(ManagerLink {
            node,
            recent: Vec::new(),
        });
        Ok(())
    }

    pub fn remove(&self, instance: u64) {
        self.links.lock().retain(|l| l.node.instance != instance);
    }

    /// True when at least one upstream manager is bound.
    pub fn present(&self) -> bool {
        self.links.lock().iter().any(|l| l.node.is_bound())
    }

    pub fn members(&self) -> Vec<Arc<CmsNode>> {
        self.links.lock().iter().map(|l| l.node.clone()).collect()
    }

    /// Back-propagates `frame` to every manager, skipping destinations
    /// that were sent an identical payload within the dedup window.
    pub fn inform(&self, frame: &Frame) {
        let digest = payload_hash(frame);
        let now = Instant::now();
        let window = self.window;
        let mut links = self.links.lock();
        for link in links.iter_mut() {
            link.recent.retain(|(_, at)| now.duration_since(*at) < window);
            if link.recent.iter().any(|(h, _)| *h == digest) {
                debug!("{} inform suppressed by dedup window", link.node.ident);
                continue;
            }
            if link.node.send(frame.clone()).is_ok() {
                link.recent.push((digest, now));
            } else {
                warn!("{} unreachable during inform", link.node.ident);
            }
        }
    }

    /// Propagates a cache reset upward.
    pub fn reset(&self) {
        let frame = Frame::bare(ReqCode::Status, 0, StatusMod::RESET.bits());
        for link in self.links.lock().iter() {
            let _ = link.node.send(frame.clone());
        }
    }
}

fn payload_hash(frame: &Frame) -> u64 {
    let mut hasher = DefaultHasher::new();
    (frame.code as u8).hash(&mut hasher);
    frame.modifier.hash(&mut hasher);
    frame.data.hash(&mut hasher);
    hasher.finish()
}
