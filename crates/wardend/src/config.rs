//! Daemon configuration.
//!
//! Loads settings from /etc/warden/config.toml or uses defaults. Every
//! field has a serde default so a partial file works; a malformed file is
//! a startup error, not a silent fallback.

use crate::security::{self, PatternRule, SecurityConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Config file path; override with `WARDEND_CONFIG`.
pub const CONFIG_PATH: &str = "/etc/warden/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub update: UpdateSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Operator-supplied credential; a random one is generated when unset.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// systemd unit to restart after a self-update.
    #[serde(default = "default_service_unit")]
    pub service_unit: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            auth_token: None,
            service_unit: default_service_unit(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

fn default_service_unit() -> String {
    "wardend".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub enable_command_whitelist: bool,
    #[serde(default = "security::default_command_whitelist")]
    pub command_whitelist: Vec<String>,
    #[serde(default = "security::default_dangerous_commands")]
    pub dangerous_commands: Vec<String>,
    #[serde(default = "security::default_dangerous_patterns")]
    pub dangerous_patterns: Vec<PatternRule>,
    #[serde(default)]
    pub allow_sudo: bool,
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
    #[serde(default = "default_max_arguments")]
    pub max_arguments: usize,
}

impl Default for SecuritySection {
    fn default() -> Self {
        let base = SecurityConfig::default();
        Self {
            enable_command_whitelist: base.enable_command_whitelist,
            command_whitelist: base.command_whitelist,
            dangerous_commands: base.dangerous_commands,
            dangerous_patterns: base.dangerous_patterns,
            allow_sudo: base.allow_sudo,
            allowed_paths: base.allowed_paths,
            forbidden_paths: base.forbidden_paths,
            max_command_length: base.max_command_length,
            max_arguments: base.max_arguments,
        }
    }
}

impl SecuritySection {
    pub fn to_security_config(&self) -> SecurityConfig {
        SecurityConfig {
            enable_command_whitelist: self.enable_command_whitelist,
            command_whitelist: self.command_whitelist.clone(),
            dangerous_commands: self.dangerous_commands.clone(),
            dangerous_patterns: self.dangerous_patterns.clone(),
            allow_sudo: self.allow_sudo,
            allowed_paths: self.allowed_paths.clone(),
            forbidden_paths: self.forbidden_paths.clone(),
            max_command_length: self.max_command_length,
            max_arguments: self.max_arguments,
        }
    }
}

fn default_allowed_paths() -> Vec<String> {
    SecurityConfig::default().allowed_paths
}

fn default_forbidden_paths() -> Vec<String> {
    SecurityConfig::default().forbidden_paths
}

fn default_max_command_length() -> usize {
    SecurityConfig::default().max_command_length
}

fn default_max_arguments() -> usize {
    SecurityConfig::default().max_arguments
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSection {
    /// Base URL of the release server.
    #[serde(default = "default_update_url")]
    pub url: String,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self { url: default_update_url() }
    }
}

fn default_update_url() -> String {
    "https://releases.warden.dev".to_string()
}

/// Load the config from `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return Ok(AgentConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: AgentConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config {}", path.display()))?;

    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.listen_addr, "0.0.0.0:7070");
        assert_eq!(config.agent.data_dir, PathBuf::from("/var/lib/warden"));
        assert!(config.agent.auth_token.is_none());
        assert!(!config.security.enable_command_whitelist);
        assert!(!config.security.command_whitelist.is_empty());
        assert!(config.update.url.starts_with("https://"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            [agent]
            listen_addr = "127.0.0.1:9000"

            [security]
            allow_sudo = true
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.agent.service_unit, "wardend");
        assert!(config.security.allow_sudo);
        assert_eq!(config.security.max_arguments, 100);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load(Path::new("/definitely/not/a/config.toml")).unwrap();
        assert_eq!(config.agent.listen_addr, "0.0.0.0:7070");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn security_section_converts_to_policy() {
        let section: SecuritySection = toml::from_str(
            r#"
            enable_command_whitelist = true
            command_whitelist = ["ls", "cat"]
            "#,
        )
        .unwrap();
        let policy = section.to_security_config();
        assert!(policy.enable_command_whitelist);
        assert_eq!(policy.command_whitelist, vec!["ls", "cat"]);
        // unspecified knobs keep their defaults
        assert!(!policy.dangerous_commands.is_empty());
        assert!(!policy.dangerous_patterns.is_empty());
    }
}
