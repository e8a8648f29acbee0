//! Memory-pressure reclamation.
//!
//! The reclaimer samples system memory and, when forced, over the usage
//! threshold, or past its minimum interval, asks every registered target
//! (the caches) to release what it can. Under pressure targets drop
//! everything; on a routine run they only sweep expired entries.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use opentelemetry::KeyValue;
use sysinfo::{Disks, ProcessesToUpdate, System};
use tracing::{debug, info};

use crate::config::ReclaimerConfig;
use crate::model::{DiskUsage, MemoryUsage, SystemReport};
use crate::telemetry::metrics;

/// How aggressively a target should release memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// Sweep expired or otherwise dead entries.
    Routine,
    /// Usage is over the threshold: release everything that can be rebuilt.
    High,
}

/// Something holding memory that can be released and rebuilt later.
pub trait Reclaimable: Send + Sync {
    fn name(&self) -> &str;

    /// Release memory. Returns the number of entries freed.
    fn reclaim(&self, pressure: Pressure) -> u64;
}

/// Source of memory usage samples.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemoryUsage;
}

/// Probe backed by `sysinfo`.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl SystemProbe {
    /// CPU, memory, disk and process overview.
    ///
    /// Blocks for `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL` so CPU usage is
    /// measured over a real interval.
    pub fn report(&self) -> SystemReport {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu_usage();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let disks = Disks::new_with_refreshed_list();
        let disk = match disks.iter().find(|d| d.mount_point() == Path::new("/")) {
            Some(root) => DiskUsage::new(root.total_space(), root.available_space()),
            None => {
                let total = disks.iter().map(|d| d.total_space()).sum();
                let available = disks.iter().map(|d| d.available_space()).sum();
                DiskUsage::new(total, available)
            }
        };

        SystemReport {
            cpu_cores: system.cpus().len(),
            cpu_usage_percent: system.global_cpu_usage(),
            memory: MemoryUsage::new(system.total_memory(), system.used_memory()),
            disk,
            processes: system.processes().len(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn sample(&self) -> MemoryUsage {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        MemoryUsage::new(system.total_memory(), system.used_memory())
    }
}

/// Why a reclamation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Forced,
    Threshold,
    Interval,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Forced => "forced",
            Trigger::Threshold => "threshold",
            Trigger::Interval => "interval",
        }
    }
}

/// What a reclamation run did.
#[derive(Debug, Clone)]
pub struct ReclaimReport {
    pub trigger: Trigger,
    pub pressure: Pressure,
    pub freed_entries: u64,
    pub before: MemoryUsage,
    pub after: MemoryUsage,
}

pub struct Reclaimer {
    config: ReclaimerConfig,
    probe: Box<dyn MemoryProbe>,
    targets: Vec<Arc<dyn Reclaimable>>,
    last_run: Mutex<Instant>,
}

impl Reclaimer {
    pub fn new(config: ReclaimerConfig) -> Self {
        Self::with_probe(config, Box::new(SystemProbe::new()))
    }

    pub fn with_probe(config: ReclaimerConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            targets: Vec::new(),
            last_run: Mutex::new(Instant::now()),
        }
    }

    /// Register a target to be reclaimed on every run.
    pub fn with_target(mut self, target: Arc<dyn Reclaimable>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn check_usage(&self) -> MemoryUsage {
        self.probe.sample()
    }

    /// Run reclamation if forced, over threshold, or due by interval.
    /// Returns whether it actually ran.
    pub fn reclaim(&self, force: bool) -> bool {
        self.reclaim_with_report(force).is_some()
    }

    pub fn reclaim_with_report(&self, force: bool) -> Option<ReclaimReport> {
        let before = self.check_usage();
        let over_threshold = before.percent_used > self.config.threshold_percent;

        let trigger = {
            let mut last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let trigger = if force {
                Trigger::Forced
            } else if over_threshold {
                Trigger::Threshold
            } else if now.duration_since(*last_run) > self.config.min_interval() {
                Trigger::Interval
            } else {
                debug!(percent_used = before.percent_used, "reclamation not due");
                return None;
            };
            *last_run = now;
            trigger
        };

        let pressure = if over_threshold {
            Pressure::High
        } else {
            Pressure::Routine
        };

        info!(
            trigger = trigger.as_str(),
            percent_used = %format!("{:.1}", before.percent_used),
            "starting reclamation"
        );

        let mut freed_entries = 0;
        for target in &self.targets {
            let freed = target.reclaim(pressure);
            debug!(target = target.name(), freed, "target reclaimed");
            freed_entries += freed;
        }

        let after = self.check_usage();
        let freed_mb = before.used_bytes.saturating_sub(after.used_bytes) as f64 / (1024.0 * 1024.0);
        info!(
            freed_entries,
            freed_mb = %format!("{freed_mb:.1}"),
            "reclamation finished"
        );
        metrics::reclaim_runs().add(1, &[KeyValue::new("trigger", trigger.as_str())]);

        Some(ReclaimReport {
            trigger,
            pressure,
            freed_entries,
            before,
            after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_probe_reports_consistent_usage() {
        let usage = SystemProbe::new().sample();
        assert!(usage.used_bytes <= usage.total_bytes);
        assert!((0.0..=100.0).contains(&usage.percent_used));
    }

    #[test]
    fn system_report_is_sane() {
        let report = SystemProbe::new().report();
        assert!(report.cpu_cores >= 1);
        assert!(report.cpu_usage_percent >= 0.0);
        assert!(report.memory.used_bytes <= report.memory.total_bytes);
        assert!(report.disk.used_bytes <= report.disk.total_bytes);
        assert!((0.0..=100.0).contains(&report.disk.percent_used));
        // At least this test process is running.
        assert!(report.processes >= 1);
    }
}
