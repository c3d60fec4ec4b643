// src/core/meter.rs

//! The load meter: converts raw load samples into comparable load and
//! mass scores, scans local filesystems for free space, and tracks the
//! cluster-wide LastFree watermark that gates one-shot space
//! announcements.

use crate::config::SchedConfig;
use parking_lot::Mutex;
use sysinfo::{Disks, System};

/// A 6-tuple of percent loads: cpu, net, xeq, mem, pag, dsk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSample {
    pub cpu: u8,
    pub net: u8,
    pub xeq: u8,
    pub mem: u8,
    pub pag: u8,
    pub dsk: u8,
}

impl LoadSample {
    pub fn from_wire(loads: [u8; 6]) -> Self {
        LoadSample {
            cpu: loads[0],
            net: loads[1],
            xeq: loads[2],
            mem: loads[3],
            pag: loads[4],
            dsk: loads[5],
        }
    }

    pub fn to_wire(self) -> [u8; 6] {
        [self.cpu, self.net, self.xeq, self.mem, self.pag, self.dsk]
    }
}

#[derive(Debug, Default)]
struct CellAverage {
    sample: LoadSample,
    reports: u64,
}

/// Aggregates load samples into selection scores. One instance per node;
/// managers additionally fold subscriber reports into a cell average.
#[derive(Debug)]
pub struct Meter {
    weights: SchedConfig,
    local: Mutex<LoadSample>,
    cell: Mutex<CellAverage>,
    last_free: Mutex<u64>,
}

impl Meter {
    pub fn new(weights: SchedConfig) -> Self {
        Meter {
            weights,
            local: Mutex::new(LoadSample::default()),
            cell: Mutex::new(CellAverage::default()),
            last_free: Mutex::new(0),
        }
    }

    /// The scalar load score: configured weighted sum of the five
    /// machine-load percentages.
    pub fn calc_load(&self, s: &LoadSample) -> u32 {
        let w = &self.weights;
        (w.cpu * s.cpu as u32
            + w.net * s.net as u32
            + w.xeq * s.xeq as u32
            + w.mem * s.mem as u32
            + w.pag * s.pag as u32)
            / 100
    }

    /// The mass score: load plus a penalty for full disks, used by
    /// selection so nearly-full servers lose ties.
    pub fn calc_mass(&self, load: u32, dsk_util: u8) -> u32 {
        load + (self.weights.dsk * dsk_util.min(100) as u32) / 100
    }

    /// Largest free space (MB) and average utilization percent across
    /// mounted filesystems.
    pub fn free_space(&self) -> (u64, u32) {
        let disks = Disks::new_with_refreshed_list();
        let mut max_free_mb = 0u64;
        let mut total = 0u64;
        let mut avail = 0u64;
        for disk in disks.list() {
            let free_mb = disk.available_space() / (1024 * 1024);
            max_free_mb = max_free_mb.max(free_mb);
            total += disk.total_space();
            avail += disk.available_space();
        }
        let util = if total == 0 {
            0
        } else {
            (((total - avail) * 100) / total) as u32
        };
        (max_free_mb, util)
    }

    /// Samples the local machine. Network, execution-queue, and paging
    /// loads are not separately measurable here and report zero.
    pub fn sample_local(&self, sys: &mut System) -> LoadSample {
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu = sys.global_cpu_usage().clamp(0.0, 100.0) as u8;
        let mem = if sys.total_memory() == 0 {
            0
        } else {
            ((sys.used_memory() * 100) / sys.total_memory()) as u8
        };
        let (_, dsk_util) = self.free_space();
        let sample = LoadSample {
            cpu,
            net: 0,
            xeq: 0,
            mem,
            pag: 0,
            dsk: dsk_util.min(100) as u8,
        };
        *self.local.lock() = sample;
        sample
    }

    /// Folds a subscriber's report into the cell running average
    /// (manager role only).
    pub fn record(&self, s: LoadSample) {
        let mut cell = self.cell.lock();
        let n = cell.reports;
        let avg = |old: u8, new: u8| (((old as u64 * n) + new as u64) / (n + 1)) as u8;
        cell.sample = LoadSample {
            cpu: avg(cell.sample.cpu, s.cpu),
            net: avg(cell.sample.net, s.net),
            xeq: avg(cell.sample.xeq, s.xeq),
            mem: avg(cell.sample.mem, s.mem),
            pag: avg(cell.sample.pag, s.pag),
            dsk: avg(cell.sample.dsk, s.dsk),
        };
        cell.reports = n + 1;
    }

    /// Current local sample plus the largest free space figure, for
    /// upstream usage reports.
    pub fn report(&self) -> (LoadSample, u64) {
        let sample = *self.local.lock();
        let (max_free, _) = self.free_space();
        (sample, max_free)
    }

    /// The cell average of subscriber reports.
    pub fn cell_report(&self) -> LoadSample {
        self.cell.lock().sample
    }

    /// Cluster-wide largest known free space (MB).
    pub fn last_free(&self) -> u64 {
        *self.last_free.lock()
    }

    /// Raises LastFree to `free_mb` if larger, returning the previous
    /// value. The caller announces space upstream only when the old value
    /// was below the DiskMin threshold.
    pub fn raise_last_free(&self, free_mb: u64) -> u64 {
        let mut last = self.last_free.lock();
        let old = *last;
        if free_mb > *last {
            *last = free_mb;
        }
        old
    }

    /// Resets LastFree; used when the reporting subscriber goes away.
    pub fn reset_last_free(&self) {
        *self.last_free.lock() = 0;
    }
}
