// src/config.rs

//! Manages service configuration: loading, resolving defaults, and validation.

use crate::core::mask::MTMAX;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The role this node plays in the federation tree.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    Server,
    Supervisor,
    Manager,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "server" => Some(Role::Server),
            "supervisor" => Some(Role::Supervisor),
            "manager" => Some(Role::Manager),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Supervisor => "supervisor",
            Role::Manager => "manager",
        }
    }
}

/// An upstream manager endpoint this node subscribes to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManagerAddr {
    pub host: String,
    pub port: u16,
}

/// One locally exported path and its capabilities.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExportConfig {
    pub path: String,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub stage: bool,
}

/// Load-scheduling weights. `calc_load` is the weighted percent sum; the
/// disk weight feeds the mass (full-disk penalty) term.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedConfig {
    #[serde(default = "default_w_cpu")]
    pub cpu: u32,
    #[serde(default = "default_w_other")]
    pub net: u32,
    #[serde(default = "default_w_other")]
    pub xeq: u32,
    #[serde(default = "default_w_other")]
    pub mem: u32,
    #[serde(default = "default_w_other")]
    pub pag: u32,
    #[serde(default = "default_w_other")]
    pub dsk: u32,
}

fn default_w_cpu() -> u32 {
    50
}
fn default_w_other() -> u32 {
    10
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpu: default_w_cpu(),
            net: default_w_other(),
            xeq: default_w_other(),
            mem: default_w_other(),
            pag: default_w_other(),
            dsk: default_w_other(),
        }
    }
}

/// Disk thresholds governing selection eligibility and space announcements.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiskConfig {
    /// Preferred minimum free space (MB) for any selection.
    #[serde(default = "default_disk_min_mb")]
    pub min_mb: u64,
    /// Hard minimum free space (MB) required for write selection.
    #[serde(default = "default_disk_min_free_mb")]
    pub min_free_mb: u64,
    /// Preferred maximum disk utilization percent.
    #[serde(default = "default_disk_util_max")]
    pub util_max: u32,
}

fn default_disk_min_mb() -> u64 {
    1024
}
fn default_disk_min_free_mb() -> u64 {
    512
}
fn default_disk_util_max() -> u32 {
    90
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            min_mb: default_disk_min_mb(),
            min_free_mb: default_disk_min_free_mb(),
            util_max: default_disk_util_max(),
        }
    }
}

/// Retry and wait intervals handed back to clients and internal timers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DelayConfig {
    /// Wait handed to a client while a stage-in is pending.
    #[serde(with = "humantime_serde", default = "default_stage_delay")]
    pub stage: Duration,
    /// Short wait handed to a client when every candidate is busy.
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry: Duration,
    /// Bounded poll interval returned while a broadcast query is in flight.
    #[serde(with = "humantime_serde", default = "default_lookup_delay")]
    pub lookup: Duration,
    /// Deadline for a pending fast-redirect continuation.
    #[serde(with = "humantime_serde", default = "default_hold_time")]
    pub hold: Duration,
    /// Interval between peer liveness pings.
    #[serde(with = "humantime_serde", default = "default_ping_interval")]
    pub ping: Duration,
    /// Interval between local load samples reported upstream.
    #[serde(with = "humantime_serde", default = "default_perf_interval")]
    pub perf: Duration,
}

fn default_stage_delay() -> Duration {
    Duration::from_secs(60)
}
fn default_retry_delay() -> Duration {
    Duration::from_secs(3)
}
fn default_lookup_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_hold_time() -> Duration {
    Duration::from_secs(5)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_perf_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            stage: default_stage_delay(),
            retry: default_retry_delay(),
            lookup: default_lookup_delay(),
            hold: default_hold_time(),
            ping: default_ping_interval(),
            perf: default_perf_interval(),
        }
    }
}

/// Upstream-manager settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManagersConfig {
    #[serde(default)]
    pub hosts: Vec<ManagerAddr>,
    /// Identical inform payloads to one destination are suppressed within
    /// this window.
    #[serde(with = "humantime_serde", default = "default_inform_window")]
    pub inform_window: Duration,
}

fn default_inform_window() -> Duration {
    Duration::from_secs(2)
}

impl Default for ManagersConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            inform_window: default_inform_window(),
        }
    }
}

/// Logical-to-physical name translation: a single prefix remap.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct N2nConfig {
    pub lfn_prefix: String,
    pub pfn_prefix: String,
}

/// External programs for file-system mutations. When unset, the direct
/// call is used instead.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FsConfig {
    pub prog_chmod: Option<String>,
    pub prog_mkdir: Option<String>,
    pub prog_mkpath: Option<String>,
    pub prog_mv: Option<String>,
    pub prog_rm: Option<String>,
    pub prog_rmdir: Option<String>,
    pub n2n: Option<N2nConfig>,
}

/// Location-cache tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    /// Entries not refreshed by an advisory within this window are
    /// reclaimed by the timer sweep.
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub ttl: Duration,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}
fn default_cache_max_entries() -> usize {
    65536
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    role: Role,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    nid: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    /// Emit a performance log line every N load reports; 0 disables.
    #[serde(default)]
    log_perf: u32,
    #[serde(default)]
    managers: ManagersConfig,
    #[serde(default)]
    exports: Vec<ExportConfig>,
    #[serde(default)]
    sched: SchedConfig,
    #[serde(default)]
    disk: DiskConfig,
    #[serde(default)]
    delays: DelayConfig,
    #[serde(default)]
    fs: FsConfig,
    #[serde(default)]
    cache: CacheConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3121
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,
    pub host: String,
    pub port: u16,
    /// Stable node identity reported at login; defaults to `host:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nid: Option<String>,
    pub log_level: String,
    pub log_perf: u32,
    pub managers: ManagersConfig,
    pub exports: Vec<ExportConfig>,
    pub sched: SchedConfig,
    pub disk: DiskConfig,
    pub delays: DelayConfig,
    pub fs: FsConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        let raw = RawConfig::default();
        Config {
            role: raw.role,
            host: default_host(),
            port: default_port(),
            nid: None,
            log_level: default_log_level(),
            log_perf: 0,
            managers: raw.managers,
            exports: raw.exports,
            sched: raw.sched,
            disk: raw.disk,
            delays: raw.delays,
            fs: raw.fs,
            cache: raw.cache,
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            role: raw.role,
            host: raw.host,
            port: raw.port,
            nid: raw.nid,
            log_level: raw.log_level,
            log_perf: raw.log_perf,
            managers: raw.managers,
            exports: raw.exports,
            sched: raw.sched,
            disk: raw.disk,
            delays: raw.delays,
            fs: raw.fs,
            cache: raw.cache,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.managers.hosts.len() > MTMAX {
            return Err(anyhow!(
                "at most {MTMAX} upstream managers may be configured"
            ));
        }
        // A manager with its own managers is a mid-tier subscriber to a
        // super-manager; that is legal. A manager exporting local paths
        // is not: managers route, they do not hold data.
        if self.role == Role::Manager && !self.exports.is_empty() {
            return Err(anyhow!("a manager role cannot export local paths"));
        }
        if self.role != Role::Manager && self.managers.hosts.is_empty() {
            return Err(anyhow!(
                "role '{}' requires at least one upstream manager",
                self.role.as_str()
            ));
        }
        for e in &self.exports {
            if !e.path.starts_with('/') {
                return Err(anyhow!("export path '{}' must be absolute", e.path));
            }
        }
        if self.delays.lookup.as_secs() == 0 || self.delays.retry.as_secs() == 0 {
            return Err(anyhow!("delays must be at least one second"));
        }
        Ok(())
    }

    /// True when this node routes rather than holds data (manager or
    /// supervisor role).
    pub fn as_manager(&self) -> bool {
        matches!(self.role, Role::Manager | Role::Supervisor)
    }

    /// True when this node has local disk backing its exports.
    pub fn disk_ok(&self) -> bool {
        self.role == Role::Server && !self.exports.is_empty()
    }

    /// True when this node can stage files in from tertiary storage.
    pub fn disk_ss(&self) -> bool {
        self.disk_ok() && self.exports.iter().any(|e| e.stage)
    }

    /// The stable node identity announced to upstream managers.
    pub fn node_id(&self) -> String {
        self.nid
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}
