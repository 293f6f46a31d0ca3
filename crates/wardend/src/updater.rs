//! Self-update engine: check, download, verify, atomically apply, rollback.
//!
//! The apply step is a transaction with a single durable rollback point:
//! the running binary is renamed to a `.backup` sibling before the staged
//! file is copied in, and every step after staging is reversible until the
//! final cleanup. Policy and history are persisted as two JSON documents in
//! the data directory, rewritten wholesale on every change.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use warden_common::{DownloadProgress, UpdateConfig, UpdateInfo, UpdateRecord};

pub const UPDATE_CONFIG_FILE: &str = "update_config.json";
pub const UPDATE_HISTORY_FILE: &str = "update_history.json";
/// Bounded history: oldest records are evicted first.
pub const HISTORY_LIMIT: usize = 50;

const ARTIFACT_PREFIX: &str = "warden-agent";

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("update server returned {0}")]
    Server(String),
    #[error("update request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("version {0} is not available")]
    VersionUnavailable(String),
    #[error("checksum mismatch for staged update")]
    ChecksumMismatch,
    #[error("no staged update for version {0}")]
    StagedMissing(String),
    #[error("download cancelled")]
    Cancelled,
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

struct UpdaterInner {
    config: UpdateConfig,
    history: Vec<UpdateRecord>,
}

pub struct Updater {
    current_version: String,
    data_dir: PathBuf,
    update_url: String,
    /// systemd unit used for the post-apply restart.
    service_unit: String,
    client: reqwest::Client,
    inner: RwLock<UpdaterInner>,
    config_tx: watch::Sender<UpdateConfig>,
}

impl Updater {
    pub fn new(
        current_version: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        update_url: impl Into<String>,
        service_unit: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let current_version = current_version.into();
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let config: UpdateConfig = load_json(&data_dir.join(UPDATE_CONFIG_FILE)).unwrap_or_default();
        let history: Vec<UpdateRecord> =
            load_json(&data_dir.join(UPDATE_HISTORY_FILE)).unwrap_or_default();

        let client = reqwest::Client::builder()
            .user_agent(format!("warden/{current_version}"))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        let (config_tx, _) = watch::channel(config.clone());

        Ok(Self {
            current_version,
            data_dir,
            update_url: update_url.into(),
            service_unit: service_unit.into(),
            client,
            inner: RwLock::new(UpdaterInner { config, history }),
            config_tx,
        })
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub async fn config(&self) -> UpdateConfig {
        self.inner.read().await.config.clone()
    }

    pub async fn history(&self) -> Vec<UpdateRecord> {
        self.inner.read().await.history.clone()
    }

    /// Replace the update policy atomically and re-arm (or halt) the
    /// periodic checker. An update already in progress is unaffected.
    pub async fn set_config(&self, config: UpdateConfig) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.config = config.clone();
            save_json(&self.data_dir.join(UPDATE_CONFIG_FILE), &inner.config)?;
        }
        // wakes the periodic loop; a closed channel just means no loop
        let _ = self.config_tx.send(config);
        Ok(())
    }

    /// Query the release server. The last-check timestamp is persisted
    /// regardless of the outcome.
    pub async fn check(&self) -> Result<UpdateInfo, UpdateError> {
        {
            let mut inner = self.inner.write().await;
            inner.config.last_check = Some(chrono::Utc::now().to_rfc3339());
            if let Err(e) = save_json(&self.data_dir.join(UPDATE_CONFIG_FILE), &inner.config) {
                warn!("failed to persist last-check time: {e}");
            }
        }

        let url = format!("{}/api/check", self.update_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("version", self.current_version.as_str()),
                ("channel", self.config().await.channel.as_str()),
                ("os", std::env::consts::OS),
                ("arch", std::env::consts::ARCH),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpdateError::Server(response.status().to_string()));
        }

        let mut info: UpdateInfo = response.json().await?;
        info.current_version = self.current_version.clone();
        Ok(info)
    }

    /// Where a staged artifact for `version` lives.
    pub fn staged_path(&self, version: &str) -> PathBuf {
        let mut name = format!("{ARTIFACT_PREFIX}-{version}");
        if cfg!(windows) {
            name.push_str(".exe");
        }
        self.data_dir.join("downloads").join(name)
    }

    /// Stream the release artifact for `version` into the staging area,
    /// reporting progress per chunk, then verify its checksum when one is
    /// published. A verification failure removes the staged file; the
    /// running binary is never touched by this step.
    pub async fn download(
        &self,
        version: &str,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<PathBuf, UpdateError> {
        let info = self.check().await?;
        if !info.available || info.latest_version != version {
            return Err(UpdateError::VersionUnavailable(version.to_string()));
        }

        let staged = self.staged_path(version);
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = self.fetch_to(&info, &staged, progress.as_ref()).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }

        if let Some(tx) = &progress {
            let _ = tx.send(DownloadProgress::verifying(info.size)).await;
        }

        if !info.checksum.is_empty() {
            let verified = verify_checksum(&staged, &info.checksum).await?;
            if !verified {
                let _ = tokio::fs::remove_file(&staged).await;
                self.record(version, false, Some("checksum mismatch".into())).await;
                return Err(UpdateError::ChecksumMismatch);
            }
        }

        if let Some(tx) = &progress {
            let _ = tx.send(DownloadProgress::ready(info.size)).await;
        }

        info!(version, path = %staged.display(), "update staged");
        Ok(staged)
    }

    async fn fetch_to(
        &self,
        info: &UpdateInfo,
        staged: &Path,
        progress: Option<&mpsc::Sender<DownloadProgress>>,
    ) -> Result<(), UpdateError> {
        let mut response = self.client.get(&info.download_url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Server(response.status().to_string()));
        }

        let mut file = tokio::fs::File::create(staged).await?;
        let mut downloaded: u64 = 0;

        use tokio::io::AsyncWriteExt;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(tx) = progress {
                // a dropped observer means the call was cancelled; stop
                // streaming and leave no partial artifact behind
                if tx.send(DownloadProgress::downloading(downloaded, info.size)).await.is_err() {
                    return Err(UpdateError::Cancelled);
                }
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// Swap the staged artifact into place of the running executable and
    /// schedule a restart. Failures roll back to the backup and are
    /// recorded; success is recorded after the only irreversible step
    /// (cleanup) is ordered last.
    pub async fn apply(&self, version: &str) -> Result<(), UpdateError> {
        let target = std::env::current_exe()?;
        match self.apply_at(version, &target) {
            Ok(()) => {
                self.record(version, true, None).await;
                info!(version, "update applied, restart scheduled");
                self.schedule_restart();
                Ok(())
            }
            Err(e) => {
                self.record(version, false, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// The apply transaction against an explicit target path.
    ///
    /// Rename-then-copy with a reversible backup: after any failure the
    /// original path still holds a runnable executable.
    pub fn apply_at(&self, version: &str, target: &Path) -> Result<(), UpdateError> {
        let staged = self.staged_path(version);
        if !staged.is_file() {
            return Err(UpdateError::StagedMissing(version.to_string()));
        }

        let backup = PathBuf::from(format!("{}.backup", target.display()));
        std::fs::rename(target, &backup)?;

        if let Err(e) = std::fs::copy(&staged, target) {
            // roll back: the backup goes back into place
            if let Err(restore) = std::fs::rename(&backup, target) {
                error!("rollback failed, backup left at {}: {restore}", backup.display());
            }
            return Err(UpdateError::Io(e));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
            {
                warn!("failed to set executable permissions: {e}");
            }
        }

        // cleanup is the only irreversible step and runs last
        let _ = std::fs::remove_file(&staged);
        let _ = std::fs::remove_file(&backup);
        Ok(())
    }

    /// Append to the bounded history and persist it.
    pub async fn record(&self, version: &str, success: bool, error: Option<String>) {
        let record = UpdateRecord {
            version: version.to_string(),
            from_version: self.current_version.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            success,
            error,
        };

        let mut inner = self.inner.write().await;
        inner.history.push(record);
        if inner.history.len() > HISTORY_LIMIT {
            let excess = inner.history.len() - HISTORY_LIMIT;
            inner.history.drain(..excess);
        }
        if let Err(e) = save_json(&self.data_dir.join(UPDATE_HISTORY_FILE), &inner.history) {
            warn!("failed to persist update history: {e}");
        }
    }

    /// Best-effort restart: the service manager first, otherwise exit and
    /// rely on the supervisor to relaunch.
    fn schedule_restart(&self) {
        let unit = self.service_unit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let restarted = tokio::process::Command::new("systemctl")
                .args(["restart", &unit])
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false);

            if !restarted {
                warn!("systemctl restart failed, exiting for the supervisor to relaunch");
                std::process::exit(0);
            }
        });
    }

    /// Periodic check loop. Reconfiguration through [`Updater::set_config`]
    /// re-arms the interval immediately; disabling auto-update parks the
    /// loop until it is enabled again.
    pub async fn run_periodic(self: Arc<Self>) {
        let mut config_rx = self.config_tx.subscribe();
        info!("update checker started");

        loop {
            let config = config_rx.borrow().clone();

            if !config.auto_update {
                if config_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(config.effective_interval())) => {}
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// One automatic check-and-update cycle. Failures are recorded and
    /// logged, never propagated: the checker retries on its own schedule.
    async fn run_cycle(&self) {
        let info = match self.check().await {
            Ok(info) => info,
            Err(e) => {
                warn!("update check failed: {e}");
                return;
            }
        };

        if !info.available {
            debug!("already on the latest version");
            return;
        }

        info!(
            current = %self.current_version,
            latest = %info.latest_version,
            critical = info.is_critical,
            "new version available"
        );

        let config = self.config().await;
        if config.notify_only && !info.is_critical {
            info!("notify-only mode, skipping automatic install");
            return;
        }

        let version = info.latest_version.clone();
        match self.download(&version, None).await {
            Ok(_) => {}
            Err(UpdateError::ChecksumMismatch) => {
                // already recorded by download
                error!("automatic update aborted: checksum mismatch");
                return;
            }
            Err(e) => {
                error!("automatic download failed: {e}");
                self.record(&version, false, Some(e.to_string())).await;
                return;
            }
        }

        if let Err(e) = self.apply(&version).await {
            error!("automatic update failed: {e}");
        }
    }
}

/// SHA-256 the staged file and compare against the published hex digest.
pub async fn verify_checksum(path: &Path, expected: &str) -> std::io::Result<bool> {
    let path = path.to_path_buf();
    let expected = expected.trim().to_lowercase();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        let actual = hex::encode(hasher.finalize());
        Ok(actual == expected)
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), "failed to parse persisted state: {e}");
            None
        }
    }
}

fn save_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, data)
}
