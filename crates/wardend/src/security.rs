//! Command and path security policy.
//!
//! Pure validation logic over an immutable [`SecurityConfig`]: no I/O, no
//! shared mutable state. Every component that executes a command or touches
//! the filesystem goes through one of the two validators here before acting.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Characters that are never legal in a command name.
const COMMAND_NAME_METACHARS: &str = ";|&$`(){}[]<>\\\"'";

/// Tokens that enable command injection when embedded in an argument.
const INJECTION_TOKENS: &[&str] = &[";", "&&", "||", "|", "`", "$(", "${", "\n", "\r"];

/// Paths that may never be written to, even inside an allowed prefix.
const WRITE_RESTRICTED_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/group",
    "/etc/shadow",
    "/etc/sudoers",
    "/etc/ssh/sshd_config",
    "/etc/crontab",
    "/boot",
    "/usr/bin",
    "/usr/sbin",
    "/bin",
    "/sbin",
];

/// A dangerous-command regex with a human-readable description, matched
/// against the lowercased joined command line.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub description: String,
}

impl PatternRule {
    fn new(pattern: &str, description: &str) -> Self {
        Self { pattern: pattern.to_string(), description: description.to_string() }
    }
}

/// Immutable security policy, shared read-only by all validation calls.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Only allow commands whose base name appears in `command_whitelist`.
    pub enable_command_whitelist: bool,
    pub command_whitelist: Vec<String>,
    /// Substrings that are always rejected (case-insensitive).
    pub dangerous_commands: Vec<String>,
    pub dangerous_patterns: Vec<PatternRule>,
    pub allow_sudo: bool,
    /// Path prefixes file operations are confined to. Empty disables the
    /// allow-list check.
    pub allowed_paths: Vec<String>,
    pub forbidden_paths: Vec<String>,
    pub max_command_length: usize,
    pub max_arguments: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_command_whitelist: false,
            command_whitelist: default_command_whitelist(),
            dangerous_commands: default_dangerous_commands(),
            dangerous_patterns: default_dangerous_patterns(),
            allow_sudo: false,
            allowed_paths: ["/home", "/var/log", "/tmp", "/opt", "/etc"]
                .map(String::from)
                .to_vec(),
            forbidden_paths: ["/etc/shadow", "/etc/sudoers", "/root/.ssh", "/proc", "/sys"]
                .map(String::from)
                .to_vec(),
            max_command_length: 10_000,
            max_arguments: 100,
        }
    }
}

pub fn default_command_whitelist() -> Vec<String> {
    [
        // system information
        "uname", "hostname", "uptime", "whoami", "id", "date", "cal",
        // read-only file inspection
        "ls", "cat", "head", "tail", "less", "more", "file", "stat", "wc", "du", "df",
        "find", "locate", "which", "whereis", "readlink",
        // text processing
        "grep", "awk", "sed", "cut", "sort", "uniq", "tr", "diff", "comm",
        // network diagnostics
        "ping", "traceroute", "nslookup", "dig", "host", "netstat", "ss", "ip", "ifconfig",
        "curl", "wget",
        // processes
        "ps", "top", "htop", "pgrep", "pidof", "lsof",
        // service management
        "systemctl", "service", "journalctl",
        // containers
        "docker", "docker-compose",
        // package queries
        "apt", "yum", "dnf", "pacman", "rpm", "dpkg",
        // misc
        "echo", "printf", "env", "printenv", "free", "vmstat", "iostat",
        "tar", "gzip", "gunzip", "zip", "unzip", "xz",
        "ssh-keygen", "openssl",
        "git", "npm", "node", "python", "python3", "pip", "pip3",
        "nginx", "mysql", "psql", "redis-cli", "mongo",
    ]
    .map(String::from)
    .to_vec()
}

pub fn default_dangerous_commands() -> Vec<String> {
    [
        // destructive filesystem operations
        "rm -rf /", "rm -rf /*", "rm -rf ~", "rm -rf .",
        "mkfs", "fdisk", "parted", "dd if=/dev/zero",
        // fork bomb
        ":(){ :|:& };:",
        // permission sabotage
        "chmod 777 /", "chown -R",
        // attack tooling
        "nmap -sS", "hping3", "slowloris",
        // raw disk writes
        "> /dev/sda", "mv /* /dev/null",
        // credential harvesting
        "cat /etc/shadow", "cat /etc/passwd",
    ]
    .map(String::from)
    .to_vec()
}

pub fn default_dangerous_patterns() -> Vec<PatternRule> {
    vec![
        PatternRule::new(r"rm\s+(-[rf]+\s+)*(/|/\*|\.\.|~)", "destructive rm invocation"),
        PatternRule::new(r">\s*/dev/[sh]d[a-z]", "attempt to overwrite a disk device"),
        PatternRule::new(r"dd\s+.*of=/dev/[sh]d[a-z]", "attempt to write to a disk device"),
        PatternRule::new(r"mkfs", "attempt to format a filesystem"),
        PatternRule::new(r":\(\)\s*\{.*\}", "fork bomb"),
        PatternRule::new(r"/etc/shadow", "attempt to access the shadow file"),
        PatternRule::new(r"/etc/sudoers", "attempt to access the sudoers file"),
        PatternRule::new(r"eval\s+.*\$", "eval with variable expansion"),
        PatternRule::new(r"\$\(.*\)", "command substitution"),
        PatternRule::new("`.*`", "backtick command substitution"),
    ]
}

/// First failing check, in check order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("command length exceeds limit ({0} > {1})")]
    CommandTooLong(usize, usize),
    #[error("argument count exceeds limit ({0} > {1})")]
    TooManyArguments(usize, usize),
    #[error("sudo execution is disabled")]
    SudoDisabled,
    #[error("dangerous command detected: {0}")]
    DangerousCommand(String),
    #[error("security check failed: {0}")]
    DangerousPattern(String),
    #[error("command name contains illegal characters")]
    IllegalCommandName,
    #[error("argument contains potential command injection: {0:?}")]
    InjectionToken(String),
    #[error("command '{0}' is not in the allowed list")]
    NotWhitelisted(String),
    #[error("path traversal detected")]
    PathTraversal,
    #[error("absolute path required")]
    NotAbsolute,
    #[error("access to path is forbidden: {0}")]
    ForbiddenPath(String),
    #[error("path is outside the allowed set: {0}")]
    OutsideAllowedPaths(String),
    #[error("writes to system-critical path are forbidden: {0}")]
    WriteRestricted(String),
}

/// Validates commands before execution. Checks run in a fixed order and the
/// first failure wins; callers must not retry a rejected command.
#[derive(Clone)]
pub struct CommandValidator {
    config: Arc<SecurityConfig>,
    patterns: Arc<Vec<(Regex, String)>>,
}

impl CommandValidator {
    pub fn new(config: Arc<SecurityConfig>) -> anyhow::Result<Self> {
        let mut patterns = Vec::with_capacity(config.dangerous_patterns.len());
        for rule in &config.dangerous_patterns {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                anyhow::anyhow!("invalid dangerous pattern {:?}: {e}", rule.pattern)
            })?;
            patterns.push((re, rule.description.clone()));
        }
        Ok(Self { config, patterns: Arc::new(patterns) })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn validate(&self, command: &str, args: &[String], sudo: bool) -> Result<(), PolicyError> {
        let full_command = if args.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", command, args.join(" "))
        };

        if full_command.len() > self.config.max_command_length {
            return Err(PolicyError::CommandTooLong(
                full_command.len(),
                self.config.max_command_length,
            ));
        }
        if args.len() > self.config.max_arguments {
            return Err(PolicyError::TooManyArguments(args.len(), self.config.max_arguments));
        }

        if sudo && !self.config.allow_sudo {
            return Err(PolicyError::SudoDisabled);
        }

        self.check_dangerous(&full_command)?;
        self.check_injection(command, args)?;

        if self.config.enable_command_whitelist && !self.is_whitelisted(command) {
            return Err(PolicyError::NotWhitelisted(command.to_string()));
        }

        Ok(())
    }

    fn check_dangerous(&self, full_command: &str) -> Result<(), PolicyError> {
        let lowered = full_command.to_lowercase();

        for dangerous in &self.config.dangerous_commands {
            if lowered.contains(&dangerous.to_lowercase()) {
                return Err(PolicyError::DangerousCommand(dangerous.clone()));
            }
        }

        for (pattern, description) in self.patterns.iter() {
            if pattern.is_match(&lowered) {
                return Err(PolicyError::DangerousPattern(description.clone()));
            }
        }

        Ok(())
    }

    fn check_injection(&self, command: &str, args: &[String]) -> Result<(), PolicyError> {
        if command.contains(|c| COMMAND_NAME_METACHARS.contains(c)) {
            return Err(PolicyError::IllegalCommandName);
        }

        for arg in args {
            for token in INJECTION_TOKENS {
                if arg.contains(token) {
                    return Err(PolicyError::InjectionToken(token.to_string()));
                }
            }
        }

        Ok(())
    }

    fn is_whitelisted(&self, command: &str) -> bool {
        let base = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| command.to_string());

        self.config
            .command_whitelist
            .iter()
            .any(|allowed| *allowed == base || *allowed == command)
    }
}

/// Validates filesystem paths against the allowed/forbidden prefix lists.
///
/// Containment is decided on the lexically-normalized path: `..` segments
/// are resolved before prefix matching, so a path that climbs out of an
/// allowed prefix lands on whatever it actually names and is judged there.
#[derive(Clone)]
pub struct PathValidator {
    config: Arc<SecurityConfig>,
}

impl PathValidator {
    pub fn new(config: Arc<SecurityConfig>) -> Self {
        Self { config }
    }

    pub fn validate(&self, path: &str) -> Result<PathBuf, PolicyError> {
        let cleaned = clean_path(path);

        // fast-path reject for parent segments that survive normalization
        if path.contains("..") && cleaned.to_string_lossy().contains("..") {
            return Err(PolicyError::PathTraversal);
        }

        if !cleaned.is_absolute() {
            return Err(PolicyError::NotAbsolute);
        }

        for forbidden in &self.config.forbidden_paths {
            if cleaned.starts_with(forbidden) {
                return Err(PolicyError::ForbiddenPath(forbidden.clone()));
            }
        }

        if !self.config.allowed_paths.is_empty() {
            let allowed =
                self.config.allowed_paths.iter().any(|prefix| cleaned.starts_with(prefix));
            if !allowed {
                return Err(PolicyError::OutsideAllowedPaths(
                    cleaned.to_string_lossy().to_string(),
                ));
            }
        }

        Ok(cleaned)
    }

    pub fn validate_for_write(&self, path: &str) -> Result<PathBuf, PolicyError> {
        let cleaned = self.validate(path)?;

        for restricted in WRITE_RESTRICTED_PATHS {
            if cleaned.starts_with(restricted) {
                return Err(PolicyError::WriteRestricted((*restricted).to_string()));
            }
        }

        Ok(cleaned)
    }
}

/// Lexically normalize a path: resolve `.` and `..` segments without
/// touching the filesystem. On an absolute path a leading `..` cannot climb
/// above the root and is dropped.
pub fn clean_path(path: &str) -> PathBuf {
    let absolute = Path::new(path).is_absolute();
    let mut out = PathBuf::new();

    for component in Path::new(path).components() {
        match component {
            Component::RootDir => out.push("/"),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // only a normal segment can be climbed out of; a kept `..`
                // (relative path) must not swallow another one
                let last_is_normal =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                if last_is_normal {
                    out.pop();
                } else if !absolute {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }

    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
