//! Interactive shell sessions over a pseudo-terminal.
//!
//! One session per duplex call. The PTY reader is a blocking thread pumping
//! into a channel (PTY readers have no async form); the writer and resize
//! handles stay with the owning task. Dropping the session kills the child
//! and releases the PTY pair.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_SHELL: &str = "/bin/bash";
const PTY_READ_BUFFER: usize = 8192;
const OUTPUT_CHANNEL_DEPTH: usize = 64;

/// `Created -> Running -> Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Closed,
}

pub struct ShellSession {
    state: SessionState,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl ShellSession {
    /// Resolve the shell, spawn it attached to a PTY of the requested
    /// size, and start the output pump. Resolution order: explicit choice,
    /// `$SHELL`, then the hard-coded fallback.
    pub fn spawn(
        shell: Option<&str>,
        rows: u16,
        cols: u16,
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let shell = shell
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let size = PtySize {
            rows: if rows == 0 { 24 } else { rows },
            cols: if cols == 0 { 80 } else { cols },
            pixel_width: 0,
            pixel_height: 0,
        };

        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size).context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn shell {shell:?}"))?;
        // the slave side lives on inside the child
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader().context("failed to clone pty reader")?;
        let writer = pair.master.take_writer().context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        std::thread::spawn(move || {
            let mut buf = [0u8; PTY_READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    // EOF: the shell exited or the master was closed
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("pty read ended: {e}");
                        break;
                    }
                }
            }
        });

        debug!(shell = %shell, rows = size.rows, cols = size.cols, "shell session started");

        Ok(Self {
            state: SessionState::Running,
            master: pair.master,
            writer,
            child,
            output_rx: Some(rx),
        })
    }

    /// The output channel; yields raw PTY bytes until end-of-stream.
    /// Can be taken exactly once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.take()
    }

    /// Write caller bytes verbatim to the terminal.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).context("pty write failed")?;
        self.writer.flush().context("pty flush failed")?;
        Ok(())
    }

    /// Apply a new terminal size without interrupting the data stream.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .context("pty resize failed")
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Kill the child and release the PTY. Idempotent; in-flight output is
    /// delivered best-effort only.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Err(e) = self.child.kill() {
            // already-exited children are fine
            debug!("shell child kill: {e}");
        }
        if let Err(e) = self.child.wait() {
            warn!("shell child reap failed: {e}");
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect_until(
        rx: &mut mpsc::Receiver<Vec<u8>>,
        needle: &str,
        timeout: Duration,
    ) -> String {
        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(chunk)) => {
                    collected.push_str(&String::from_utf8_lossy(&chunk));
                    if collected.contains(needle) {
                        return collected;
                    }
                }
                Ok(None) => return collected,
                Err(_) => return collected,
            }
        }
    }

    #[tokio::test]
    async fn session_echoes_command_output() {
        let mut session =
            ShellSession::spawn(Some("/bin/sh"), 24, 80, &HashMap::new()).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        let mut rx = session.take_output().unwrap();

        session.write(b"echo warden-$((40+2))\n").unwrap();
        let output = collect_until(&mut rx, "warden-42", Duration::from_secs(10)).await;
        assert!(output.contains("warden-42"), "output was: {output:?}");

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn output_ends_after_shell_exit() {
        let mut session =
            ShellSession::spawn(Some("/bin/sh"), 24, 80, &HashMap::new()).unwrap();
        let mut rx = session.take_output().unwrap();

        session.write(b"exit\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break, // end of stream
                Err(_) => panic!("pty output did not end after exit"),
            }
        }
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let mut a = ShellSession::spawn(Some("/bin/sh"), 24, 80, &HashMap::new()).unwrap();
        let mut b = ShellSession::spawn(Some("/bin/sh"), 24, 80, &HashMap::new()).unwrap();
        let mut rx_a = a.take_output().unwrap();
        let mut rx_b = b.take_output().unwrap();

        a.write(b"echo session-$((100+1))\n").unwrap();
        b.write(b"echo session-$((200+2))\n").unwrap();

        let out_a = collect_until(&mut rx_a, "session-101", Duration::from_secs(10)).await;
        let out_b = collect_until(&mut rx_b, "session-202", Duration::from_secs(10)).await;

        assert!(out_a.contains("session-101"));
        assert!(!out_a.contains("session-202"));
        assert!(out_b.contains("session-202"));
        assert!(!out_b.contains("session-101"));
    }

    #[test]
    fn resize_applies_without_error() {
        let mut session =
            ShellSession::spawn(Some("/bin/sh"), 24, 80, &HashMap::new()).unwrap();
        session.resize(50, 132).unwrap();
        session.close();
    }

    #[tokio::test]
    async fn env_overrides_reach_the_shell() {
        let mut env = HashMap::new();
        env.insert("WARDEN_SHELL_TEST".to_string(), "present".to_string());
        let mut session = ShellSession::spawn(Some("/bin/sh"), 24, 80, &env).unwrap();
        let mut rx = session.take_output().unwrap();

        session.write(b"echo value=$WARDEN_SHELL_TEST\n").unwrap();
        let output = collect_until(&mut rx, "value=present", Duration::from_secs(10)).await;
        assert!(output.contains("value=present"), "output was: {output:?}");
    }
}
