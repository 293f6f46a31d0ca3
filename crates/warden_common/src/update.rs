//! Self-update metadata: the persisted policy, the check contract with the
//! release server, and the progress/history shapes.

use serde::{Deserialize, Serialize};

/// Release stream the agent follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateChannel {
    #[default]
    Stable,
    Beta,
    Nightly,
}

impl UpdateChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateChannel::Stable => "stable",
            UpdateChannel::Beta => "beta",
            UpdateChannel::Nightly => "nightly",
        }
    }
}

impl std::fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The process-wide update policy. Persisted as one JSON document and
/// replaced wholesale on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub auto_update: bool,
    /// Seconds between periodic checks.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default)]
    pub channel: UpdateChannel,
    /// RFC3339 timestamp of the most recent check, successful or not.
    #[serde(default)]
    pub last_check: Option<String>,
    /// Report available updates without installing them.
    #[serde(default = "default_notify_only")]
    pub notify_only: bool,
}

fn default_check_interval() -> u64 {
    3600
}

fn default_notify_only() -> bool {
    true
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            auto_update: false,
            check_interval: default_check_interval(),
            channel: UpdateChannel::Stable,
            last_check: None,
            notify_only: default_notify_only(),
        }
    }
}

impl UpdateConfig {
    /// Interval actually used by the periodic checker; a zero in a
    /// hand-edited config file falls back to the default.
    pub fn effective_interval(&self) -> u64 {
        if self.check_interval == 0 {
            default_check_interval()
        } else {
            self.check_interval
        }
    }
}

/// Answer from `GET <base>/api/check?version=&channel=&os=&arch=`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateInfo {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub latest_version: String,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
    /// SHA-256 of the release artifact, hex. Empty means unpublished.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub is_critical: bool,
}

/// One entry in the bounded update history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub version: String,
    pub from_version: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    Downloading,
    Verifying,
    Ready,
}

/// Transient progress report emitted while staging a release artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
    pub percent: u32,
    pub phase: DownloadPhase,
}

impl DownloadProgress {
    pub fn downloading(downloaded: u64, total: u64) -> Self {
        let percent = if total > 0 {
            ((downloaded as f64 / total as f64) * 100.0) as u32
        } else {
            0
        };
        Self { downloaded, total, percent, phase: DownloadPhase::Downloading }
    }

    pub fn verifying(total: u64) -> Self {
        Self { downloaded: total, total, percent: 100, phase: DownloadPhase::Verifying }
    }

    pub fn ready(total: u64) -> Self {
        Self { downloaded: total, total, percent: 100, phase: DownloadPhase::Ready }
    }
}
