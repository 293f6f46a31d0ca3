//! Bounded command execution.
//!
//! Runs a single validated command to completion with captured output. A
//! non-zero exit code is reported faithfully in the result; only
//! infrastructure failures (spawn, I/O, timeout) surface as errors.

use crate::security::{CommandValidator, PolicyError};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;
use warden_common::CommandResult;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("failed to start command: {0}")]
    Spawn(std::io::Error),
    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("io failure while running command: {0}")]
    Io(std::io::Error),
}

/// Execution parameters beyond the command line itself.
#[derive(Debug, Default)]
pub struct ExecOptions {
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    /// None applies [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
    pub sudo: bool,
}

/// Validate and run one command. The validator runs first; a rejected
/// command is never spawned.
pub async fn run(
    validator: &CommandValidator,
    command: &str,
    args: &[String],
    options: ExecOptions,
) -> Result<CommandResult, ExecError> {
    validator.validate(command, args, options.sudo)?;

    let mut cmd = if options.sudo {
        let mut c = Command::new("sudo");
        c.arg("-n").arg(command).args(args);
        c
    } else {
        let mut c = Command::new(command);
        c.args(args);
        c
    };

    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(&options.env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);
    let started = Instant::now();

    debug!(command, ?args, sudo = options.sudo, "executing command");

    let child = cmd.spawn().map_err(ExecError::Spawn)?;

    // kill_on_drop reaps the child if the wait future is dropped on timeout
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        }),
        Ok(Err(e)) => Err(ExecError::Io(e)),
        Err(_) => Err(ExecError::Timeout(timeout)),
    }
}
