//! System inventory, metric samples, and process listing via sysinfo, with
//! /proc fallbacks where sysinfo has no coverage.

use std::sync::Mutex;
use sysinfo::{Disks, Networks, ProcessesToUpdate, System, Users};
use warden_common::{
    CpuInfo, DiskInfo, DiskMetric, MemoryInfo, MetricsSample, NetworkInfo, NetworkMetric,
    ProcessInfo, SystemInfo,
};

pub struct Collector {
    sys: Mutex<System>,
}

impl Collector {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self { sys: Mutex::new(sys) }
    }

    /// Static inventory: host identity, CPU, memory, disks, interfaces.
    pub fn system_info(&self) -> SystemInfo {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_all();

        let cpus = sys.cpus();
        let cpu = CpuInfo {
            model: cpus.first().map(|c| c.brand().to_string()).unwrap_or_default(),
            cores: sys.physical_core_count().unwrap_or(0) as u32,
            threads: cpus.len() as u32,
            frequency_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
            usage_per_core: cpus.iter().map(|c| c.cpu_usage()).collect(),
        };

        let total = sys.total_memory();
        let used = sys.used_memory();
        let memory = MemoryInfo {
            total,
            available: sys.available_memory(),
            used,
            used_percent: percent(used, total),
            swap_total: sys.total_swap(),
            swap_used: sys.used_swap(),
        };

        let disks = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|disk| {
                let total = disk.total_space();
                let free = disk.available_space();
                let used = total.saturating_sub(free);
                DiskInfo {
                    device: disk.name().to_string_lossy().to_string(),
                    mountpoint: disk.mount_point().to_string_lossy().to_string(),
                    fstype: disk.file_system().to_string_lossy().to_string(),
                    total,
                    used,
                    free,
                    used_percent: percent(used, total),
                }
            })
            .collect();

        let networks = Networks::new_with_refreshed_list()
            .iter()
            .map(|(name, data)| NetworkInfo {
                name: name.clone(),
                addresses: data.ip_networks().iter().map(|ip| ip.to_string()).collect(),
                mac: data.mac_address().to_string(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
            })
            .collect();

        SystemInfo {
            hostname: System::host_name().unwrap_or_default(),
            os: System::name().unwrap_or_default(),
            platform: System::distribution_id(),
            platform_version: System::os_version().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            uptime_secs: System::uptime(),
            boot_time: System::boot_time(),
            cpu,
            memory,
            disks,
            networks,
        }
    }

    /// One metrics sample. CPU usage is the delta since the previous
    /// refresh, so the first sample after startup reads low.
    pub fn sample(&self) -> MetricsSample {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let load = System::load_average();
        let networks = Networks::new_with_refreshed_list()
            .iter()
            .map(|(name, data)| NetworkMetric {
                interface: name.clone(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
                packets_sent: data.total_packets_transmitted(),
                packets_recv: data.total_packets_received(),
            })
            .collect();

        MetricsSample {
            timestamp: chrono::Utc::now().timestamp(),
            cpu_usage: f64::from(sys.global_cpu_usage()),
            memory_usage: percent(sys.used_memory(), sys.total_memory()),
            load1: load.one,
            load5: load.five,
            load15: load.fifteen,
            disks: read_diskstats(),
            networks,
        }
    }

    /// Snapshot of running processes, optionally filtered by substring on
    /// name and by user.
    pub fn processes(
        &self,
        name_filter: Option<&str>,
        user_filter: Option<&str>,
    ) -> Vec<ProcessInfo> {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes(ProcessesToUpdate::All);
        let users = Users::new_with_refreshed_list();

        let mut processes: Vec<ProcessInfo> = sys
            .processes()
            .values()
            .map(|process| {
                let user = process
                    .user_id()
                    .map(|uid| {
                        users
                            .list()
                            .iter()
                            .find(|u| u.id() == uid)
                            .map(|u| u.name().to_string())
                            .unwrap_or_else(|| uid.to_string())
                    })
                    .unwrap_or_default();

                ProcessInfo {
                    pid: process.pid().as_u32(),
                    ppid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
                    name: process.name().to_string_lossy().to_string(),
                    user,
                    status: process.status().to_string(),
                    cpu_percent: process.cpu_usage(),
                    memory_percent: percent(process.memory(), sys.total_memory()) as f32,
                    memory_rss: process.memory(),
                    start_time: process.start_time(),
                    cmdline: process
                        .cmd()
                        .iter()
                        .map(|s| s.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" "),
                }
            })
            .filter(|p| {
                name_filter.map_or(true, |f| p.name.contains(f))
                    && user_filter.map_or(true, |f| p.user == f)
            })
            .collect();

        processes.sort_by_key(|p| p.pid);
        processes
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

/// Per-device IO counters from /proc/diskstats; sysinfo exposes none.
/// Sector counts are in 512-byte units regardless of the device's real
/// sector size.
fn read_diskstats() -> Vec<DiskMetric> {
    let Ok(content) = std::fs::read_to_string("/proc/diskstats") else {
        return Vec::new();
    };
    parse_diskstats(&content)
}

fn parse_diskstats(content: &str) -> Vec<DiskMetric> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let device = fields[2];
            if device.starts_with("loop") || device.starts_with("ram") || device.starts_with("zram")
            {
                return None;
            }
            Some(DiskMetric {
                device: device.to_string(),
                read_count: fields[3].parse().ok()?,
                read_bytes: fields[5].parse::<u64>().ok()? * 512,
                write_count: fields[7].parse().ok()?,
                write_bytes: fields[9].parse::<u64>().ok()? * 512,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_has_host_basics() {
        let collector = Collector::new();
        let info = collector.system_info();
        assert!(!info.hostname.is_empty());
        assert!(!info.arch.is_empty());
        assert!(info.cpu.threads > 0);
        assert!(info.memory.total > 0);
    }

    #[test]
    fn sample_is_bounded() {
        let collector = Collector::new();
        let sample = collector.sample();
        assert!(sample.memory_usage >= 0.0 && sample.memory_usage <= 100.0);
        assert!(sample.timestamp > 0);
    }

    #[test]
    fn process_listing_contains_this_process() {
        let collector = Collector::new();
        let pid = std::process::id();
        let processes = collector.processes(None, None);
        assert!(processes.iter().any(|p| p.pid == pid));
    }

    #[test]
    fn diskstats_parser_skips_virtual_devices() {
        let content = "\
   7       0 loop0 100 0 800 0 0 0 0 0 0 0 0
   8       0 sda 5413 300 402138 2000 9436 4000 511234 8000 0 6000 10000
   8       1 sda1 5000 200 400000 1900 9000 3900 510000 7900 0 5900 9900
";
        let metrics = parse_diskstats(content);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].device, "sda");
        assert_eq!(metrics[0].read_count, 5413);
        assert_eq!(metrics[0].read_bytes, 402138 * 512);
        assert_eq!(metrics[0].write_bytes, 511234 * 512);
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert!((percent(1, 4) - 25.0).abs() < f64::EPSILON);
    }
}
