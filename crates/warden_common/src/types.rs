//! Data shapes carried by the wire protocol.

use serde::{Deserialize, Serialize};

/// Static system inventory, collected once per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub platform_version: String,
    pub kernel_version: String,
    pub arch: String,
    pub uptime_secs: u64,
    pub boot_time: u64,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disks: Vec<DiskInfo>,
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model: String,
    pub cores: u32,
    pub threads: u32,
    pub frequency_mhz: u64,
    pub usage_per_core: Vec<f32>,
}

/// All sizes in bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub addresses: Vec<String>,
    pub mac: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// One sample on the metrics stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Unix seconds at sampling time.
    pub timestamp: i64,
    /// Aggregate CPU usage, percent.
    pub cpu_usage: f64,
    /// Memory in use, percent of total.
    pub memory_usage: f64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub disks: Vec<DiskMetric>,
    pub networks: Vec<NetworkMetric>,
}

/// Cumulative IO counters for one block device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetric {
    pub device: String,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
}

/// Cumulative traffic counters for one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMetric {
    pub interface: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

/// Outcome of a bounded command run. A non-zero exit code is a result,
/// not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// Modification time, unix seconds.
    pub modified: i64,
    pub is_dir: bool,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    /// File bytes, base64-encoded.
    pub content: String,
    pub info: FileInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListing {
    pub path: String,
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: String,
    pub description: String,
    pub enabled: bool,
    pub pid: u32,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub user: String,
    pub status: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_rss: u64,
    /// Process start, unix seconds.
    pub start_time: u64,
    pub cmdline: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_result_serializes_exit_code() {
        let result = CommandResult {
            exit_code: 2,
            stdout: "out".into(),
            stderr: "err".into(),
            duration_ms: 12,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"exit_code\":2"));
    }

    #[test]
    fn file_info_round_trip() {
        let info = FileInfo {
            name: "syslog".into(),
            path: "/var/log/syslog".into(),
            size: 1024,
            mode: 0o644,
            modified: 1_700_000_000,
            is_dir: false,
            owner: "root".into(),
            group: "adm".into(),
        };
        let back: FileInfo = serde_json::from_str(&serde_json::to_string(&info).unwrap()).unwrap();
        assert_eq!(back.mode, 0o644);
        assert_eq!(back.path, "/var/log/syslog");
    }
}
