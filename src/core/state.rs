// src/core/state.rs

//! The shared service container passed into every component, plus the
//! aggregate cell state (active/staging counts) whose edges are announced
//! upstream.

use crate::config::{Config, ManagerAddr};
use crate::core::cache::LocationCache;
use crate::core::cache::paths::PathIndex;
use crate::core::cache::rrq::WaiterTable;
use crate::core::cluster::NodeTable;
use crate::core::manager::ManagerSet;
use crate::core::mask::SMask;
use crate::core::meter::Meter;
use crate::core::node::CmsNode;
use crate::core::policy::PolicyHook;
use crate::core::prepare::{PrepArgs, PrepQueue};
use crate::core::protocol::codes::StatusMod;
use crate::core::protocol::{Frame, ReqCode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::info;

/// How long a statistics snapshot stays served from cache.
const STATS_MAX_AGE: Duration = Duration::from_secs(10);

/// Aggregate cell service state. The booleans track what we last
/// announced upstream so only edges are transmitted.
#[derive(Debug, Default)]
pub struct CmsState {
    announced_suspended: AtomicBool,
    announced_nostage: AtomicBool,
    /// Local administrative suspension of this whole node.
    pub suspended: AtomicBool,
    pub nostage: AtomicBool,
}

impl CmsState {
    /// Modifier bits describing this node's own service state, used for
    /// `update` replies.
    pub fn status_modifier(&self) -> u8 {
        let mut m = StatusMod::empty();
        if self.suspended.load(Ordering::Relaxed) {
            m |= StatusMod::SUSPEND;
        } else {
            m |= StatusMod::RESUME;
        }
        if self.nostage.load(Ordering::Relaxed) {
            m |= StatusMod::NOSTAGE;
        } else {
            m |= StatusMod::STAGE;
        }
        m.bits()
    }
}

/// All long-lived services, constructed once at startup. No process-wide
/// mutable state exists outside this container and the logger.
pub struct FederationState {
    pub config: Config,
    pub table: NodeTable,
    pub managers: ManagerSet,
    pub cache: LocationCache,
    pub paths: PathIndex,
    pub rrq: WaiterTable,
    pub meter: Meter,
    pub prepq: PrepQueue,
    pub cms: CmsState,
    pub policy: Option<Arc<dyn PolicyHook>>,
    /// Alternate upstream managers learned from `try` redirections.
    pub alternates: Mutex<Vec<ManagerAddr>>,
    stats_cache: Mutex<Option<(Instant, String)>>,
    auto_req: AtomicU64,
}

impl FederationState {
    /// Builds the service container; the returned receiver feeds the
    /// prepare worker.
    pub fn new(config: Config) -> (Arc<Self>, mpsc::UnboundedReceiver<PrepArgs>) {
        Self::with_policy(config, None)
    }

    /// Like [`FederationState::new`], with an external policy hook that
    /// may claim requests before built-in handling.
    pub fn with_policy(
        config: Config,
        policy: Option<Arc<dyn PolicyHook>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PrepArgs>) {
        let (prepq, prep_rx) = PrepQueue::new();
        let state = FederationState {
            table: NodeTable::new(),
            managers: ManagerSet::new(config.managers.inform_window),
            cache: LocationCache::new(&config.cache),
            paths: PathIndex::new(),
            rrq: WaiterTable::new(config.delays.hold),
            meter: Meter::new(config.sched.clone()),
            prepq,
            cms: CmsState::default(),
            policy,
            alternates: Mutex::new(Vec::new()),
            stats_cache: Mutex::new(None),
            auto_req: AtomicU64::new(0),
            config,
        };
        (Arc::new(state), prep_rx)
    }

    /// Enqueues `frame` on every bound member of `mask`, evicting peers
    /// whose link has failed.
    pub fn broadcast(&self, mask: SMask, frame: &Frame) {
        for dead in self.table.broadcast(mask, frame) {
            self.evict(&dead, "write failed");
        }
    }

    /// Full eviction: the peer goes offline, its table slot is freed, and
    /// the bounce pass clears its bit from the path index, every cache
    /// entry, and every pending avoid mask. Idempotent.
    pub fn evict(&self, node: &Arc<CmsNode>, reason: &str) {
        node.disc(reason);
        if node.is_manager() && node.mask.is_empty() {
            self.managers.remove(node.instance);
            return;
        }
        if self.table.remove(node.id, node.instance).is_none() {
            return;
        }
        info!("{} evicted: {}", node.ident, reason);
        self.paths.remove_mask(node.mask);
        self.cache.bounce(node.mask);
        self.rrq.bounce(node.id);
        self.sync_state();
    }

    /// A statistics snapshot, regenerated at most once per window.
    pub fn stats_snapshot(&self) -> String {
        let mut cache = self.stats_cache.lock();
        if let Some((at, text)) = &*cache {
            if at.elapsed() < STATS_MAX_AGE {
                return text.clone();
            }
        }
        let text = self.table.stats();
        *cache = Some((Instant::now(), text.clone()));
        text
    }

    /// Request id for internally generated prepare jobs.
    pub fn next_auto_reqid(&self) -> String {
        format!("auto-{}", self.auto_req.fetch_add(1, Ordering::Relaxed))
    }

    /// Announces active/staging edges upstream: a cell with no active
    /// servers reports suspended, one with no staging servers reports
    /// nostage. Only changes are transmitted.
    pub fn sync_state(&self) {
        if !self.config.as_manager() {
            return;
        }
        let (active, staging) = self.table.census();
        let suspended = active == 0;
        let nostage = staging == 0;

        let was_suspended = self
            .cms
            .announced_suspended
            .swap(suspended, Ordering::Relaxed);
        let was_nostage = self.cms.announced_nostage.swap(nostage, Ordering::Relaxed);
        if was_suspended == suspended && was_nostage == nostage {
            return;
        }

        let mut modifier = StatusMod::empty();
        modifier |= if suspended {
            StatusMod::SUSPEND
        } else {
            StatusMod::RESUME
        };
        modifier |= if nostage {
            StatusMod::NOSTAGE
        } else {
            StatusMod::STAGE
        };
        info!(
            "cell state: {} active, {} staging servers",
            active, staging
        );
        self.managers
            .inform(&Frame::bare(ReqCode::Status, 0, modifier.bits()));
    }
}
