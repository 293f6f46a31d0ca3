//! Service management through systemd and process signalling.
//!
//! Unit names are validated against a conservative charset before being
//! spliced into a systemctl argv; there is no shell between us and the
//! service manager.

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;
use warden_common::{ServiceInfo, ServiceOp};

static UNIT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.@\\:-]+$").expect("unit name pattern"));

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid unit name: {0:?}")]
    InvalidUnitName(String),
    #[error("invalid signal: {0}")]
    InvalidSignal(i32),
    #[error("systemctl failed: {0}")]
    Systemctl(String),
    #[error("failed to run systemctl: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to signal process: {0}")]
    Kill(nix::Error),
}

async fn systemctl(args: &[&str]) -> Result<std::process::Output, ServiceError> {
    Ok(Command::new("systemctl").args(args).output().await?)
}

/// List systemd services with their enablement state. Pid and uptime are
/// resolved per unit for active services only.
pub async fn list_services(name_filter: Option<&str>) -> Result<Vec<ServiceInfo>, ServiceError> {
    let output = systemctl(&[
        "list-units",
        "--type=service",
        "--all",
        "--no-pager",
        "--no-legend",
        "--plain",
    ])
    .await?;
    if !output.status.success() {
        return Err(ServiceError::Systemctl(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let enabled = enablement_map().await.unwrap_or_default();

    let mut services = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        // UNIT LOAD ACTIVE SUB DESCRIPTION...
        let mut fields = line.split_whitespace();
        let (Some(unit), Some(_load), Some(active), Some(_sub)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let description = fields.collect::<Vec<_>>().join(" ");

        let name = unit.trim_end_matches(".service").to_string();
        if let Some(filter) = name_filter {
            if !name.contains(filter) {
                continue;
            }
        }

        let (pid, uptime_secs) = if active == "active" {
            unit_runtime(unit).await.unwrap_or((0, 0))
        } else {
            (0, 0)
        };

        services.push(ServiceInfo {
            name,
            status: active.to_string(),
            description,
            enabled: enabled.get(unit).map(|s| s == "enabled").unwrap_or(false),
            pid,
            uptime_secs,
        });
    }

    services.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(services)
}

/// unit file -> enablement state, from one `list-unit-files` call.
async fn enablement_map() -> Result<std::collections::HashMap<String, String>, ServiceError> {
    let output = systemctl(&[
        "list-unit-files",
        "--type=service",
        "--no-pager",
        "--no-legend",
        "--plain",
    ])
    .await?;

    let mut map = std::collections::HashMap::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut fields = line.split_whitespace();
        if let (Some(unit), Some(state)) = (fields.next(), fields.next()) {
            map.insert(unit.to_string(), state.to_string());
        }
    }
    Ok(map)
}

/// Main PID and uptime of an active unit.
async fn unit_runtime(unit: &str) -> Result<(u32, u64), ServiceError> {
    let output = systemctl(&[
        "show",
        unit,
        "--property=MainPID",
        "--property=ActiveEnterTimestampMonotonic",
        "--value",
    ])
    .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    let pid = lines.next().and_then(|l| l.trim().parse().ok()).unwrap_or(0);
    let entered_usec: u64 = lines.next().and_then(|l| l.trim().parse().ok()).unwrap_or(0);

    let uptime = system_uptime_secs().saturating_sub(entered_usec / 1_000_000);
    Ok((pid, if entered_usec == 0 { 0 } else { uptime }))
}

fn system_uptime_secs() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|n| n.parse::<f64>().ok()))
        .map(|f| f as u64)
        .unwrap_or(0)
}

/// Apply a lifecycle verb to a unit.
pub async fn service_action(name: &str, action: ServiceOp) -> Result<(), ServiceError> {
    if !UNIT_NAME.is_match(name) {
        return Err(ServiceError::InvalidUnitName(name.to_string()));
    }

    debug!(unit = name, action = action.as_str(), "service action");
    let output = systemctl(&[action.as_str(), name]).await?;
    if !output.status.success() {
        return Err(ServiceError::Systemctl(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Send a signal to a process. Signal 0 defaults to SIGTERM.
pub fn kill_process(pid: i32, signal: i32) -> Result<(), ServiceError> {
    let sig = if signal == 0 {
        nix::sys::signal::Signal::SIGTERM
    } else {
        nix::sys::signal::Signal::try_from(signal)
            .map_err(|_| ServiceError::InvalidSignal(signal))?
    };

    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig).map_err(ServiceError::Kill)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_name_charset() {
        assert!(UNIT_NAME.is_match("nginx"));
        assert!(UNIT_NAME.is_match("getty@tty1"));
        assert!(UNIT_NAME.is_match("dbus-org.freedesktop.login1"));
        assert!(!UNIT_NAME.is_match("nginx; rm -rf /"));
        assert!(!UNIT_NAME.is_match("a b"));
        assert!(!UNIT_NAME.is_match(""));
    }

    #[tokio::test]
    async fn action_rejects_bad_unit_names() {
        let err = service_action("x && reboot", ServiceOp::Stop).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidUnitName(_)));
    }

    #[test]
    fn invalid_signal_is_rejected() {
        let err = kill_process(std::process::id() as i32, 4096).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSignal(4096)));
    }

    #[test]
    fn signalling_a_missing_process_fails() {
        // pid near i32::MAX should not exist
        let err = kill_process(i32::MAX - 1, 15).unwrap_err();
        assert!(matches!(err, ServiceError::Kill(_)));
    }
}
