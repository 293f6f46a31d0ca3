//! Shared daemon state, constructed once in `main` and injected into the
//! dispatcher. Tests build isolated instances with their own policy.

use crate::auth::AuthGuard;
use crate::collector::Collector;
use crate::fileops::FileOps;
use crate::security::{CommandValidator, PathValidator, SecurityConfig};
use crate::updater::Updater;
use std::sync::Arc;
use std::time::Instant;

pub struct DaemonState {
    pub version: String,
    pub start_time: Instant,
    pub auth: AuthGuard,
    pub commands: CommandValidator,
    pub files: FileOps,
    pub collector: Collector,
    pub updater: Arc<Updater>,
}

impl DaemonState {
    pub fn new(
        version: impl Into<String>,
        auth: AuthGuard,
        security: Arc<SecurityConfig>,
        updater: Arc<Updater>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            version: version.into(),
            start_time: Instant::now(),
            auth,
            commands: CommandValidator::new(Arc::clone(&security))?,
            files: FileOps::new(PathValidator::new(security)),
            collector: Collector::new(),
            updater,
        })
    }
}
