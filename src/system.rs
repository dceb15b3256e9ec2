//! Host CPU and memory sampling for the `/stats` document and system gauges.
//!
//! Linux only; on other platforms every sample reads as zero.

use serde::Serialize;
#[cfg(target_os = "linux")]
use tracing::debug;

/// One reading of host resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemSample {
    #[serde(rename = "cpu_usage")]
    pub cpu_usage_percent: f64,
    #[serde(rename = "memory_usage")]
    pub memory_used_bytes: u64,
}

/// Aggregate CPU ticks across all cores.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

impl CpuTimes {
    #[cfg(target_os = "linux")]
    fn from_kernel(cpu: &procfs::CpuTime) -> Self {
        let idle = cpu.idle + cpu.iowait.unwrap_or(0);
        let total = cpu.user
            + cpu.nice
            + cpu.system
            + idle
            + cpu.irq.unwrap_or(0)
            + cpu.softirq.unwrap_or(0)
            + cpu.steal.unwrap_or(0);
        Self {
            busy: total.saturating_sub(idle),
            total,
        }
    }

    /// Busy percentage between two readings.
    fn usage_since(&self, previous: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(previous.total);
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy.saturating_sub(previous.busy);
        busy as f64 / total as f64 * 100.0
    }
}

/// Samples host CPU and memory. CPU usage is measured between consecutive
/// calls to [`SystemProbe::sample`], so the first reading is 0.
#[derive(Debug, Default)]
pub struct SystemProbe {
    last_cpu: Option<CpuTimes>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self) -> SystemSample {
        let cpu_usage_percent = match (read_cpu_times(), self.last_cpu) {
            (Some(now), Some(previous)) => {
                self.last_cpu = Some(now);
                now.usage_since(&previous)
            }
            (Some(now), None) => {
                self.last_cpu = Some(now);
                0.0
            }
            (None, _) => 0.0,
        };

        SystemSample {
            cpu_usage_percent,
            memory_used_bytes: read_memory_used().unwrap_or(0),
        }
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    use procfs::{CurrentSI, KernelStats};

    match KernelStats::current() {
        Ok(stats) => Some(CpuTimes::from_kernel(&stats.total)),
        Err(e) => {
            debug!(error = %e, "Failed to read /proc/stat");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

/// `MemTotal - MemAvailable` in bytes, falling back to `MemFree` on old kernels.
#[cfg(target_os = "linux")]
fn read_memory_used() -> Option<u64> {
    use procfs::{Current, Meminfo};

    match Meminfo::current() {
        Ok(meminfo) => {
            let available = meminfo.mem_available.unwrap_or(meminfo.mem_free);
            Some(meminfo.mem_total.saturating_sub(available))
        }
        Err(e) => {
            debug!(error = %e, "Failed to read /proc/meminfo");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_memory_used() -> Option<u64> {
    None
}

/// Resident set size of this process in bytes.
#[cfg(target_os = "linux")]
pub fn process_rss_bytes() -> Option<u64> {
    use procfs::process::Process;

    match Process::myself() {
        Ok(me) => match me.stat() {
            // RSS is in pages, typically 4KB per page
            Ok(stat) => Some(stat.rss * 4096),
            Err(e) => {
                debug!(error = %e, "Failed to read /proc/self/stat");
                None
            }
        },
        Err(e) => {
            debug!(error = %e, "Failed to read /proc memory stats");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn process_rss_bytes() -> Option<u64> {
    None
}
