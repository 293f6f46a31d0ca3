//! Warden agent daemon entry point.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wardend::auth::AuthGuard;
use wardend::state::DaemonState;
use wardend::updater::Updater;
use wardend::{config, server};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("wardend v{VERSION} starting");

    let config_path = std::env::var("WARDEND_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config::CONFIG_PATH));
    let cfg = config::load(&config_path)?;

    std::fs::create_dir_all(&cfg.agent.data_dir).with_context(|| {
        format!("failed to create data directory {}", cfg.agent.data_dir.display())
    })?;

    let auth = AuthGuard::new(cfg.agent.auth_token.clone())?;
    if auth.is_generated() {
        let token_path = cfg.agent.data_dir.join("agent_token");
        persist_token(&token_path, auth.token())?;
        info!(
            path = %token_path.display(),
            "no auth token configured, a generated token was written for operator retrieval"
        );
    }

    let updater = Arc::new(Updater::new(
        VERSION,
        &cfg.agent.data_dir,
        cfg.update.url.clone(),
        cfg.agent.service_unit.clone(),
    )?);
    tokio::spawn(Arc::clone(&updater).run_periodic());

    let security = Arc::new(cfg.security.to_security_config());
    let state = Arc::new(DaemonState::new(VERSION, auth, security, updater)?);

    server::run(state, &cfg.agent.listen_addr).await
}

/// Write the generated token where only the owner can read it.
fn persist_token(path: &std::path::Path, token: &str) -> Result<()> {
    std::fs::write(path, token)
        .with_context(|| format!("failed to write token file {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict token file {}", path.display()))?;
    }
    Ok(())
}
