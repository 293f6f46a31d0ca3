//! Interactive shell: raw local terminal bridged to a remote PTY session.

use crate::client::AgentClient;
use anyhow::Result;
use std::collections::HashMap;
use std::io::{Read, Write};
use tokio::sync::mpsc;
use warden_common::{b64, Method, ResponseData};

/// Restores the local terminal mode on drop, so errors do not leave the
/// operator's terminal raw.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

pub async fn run(mut client: AgentClient, shell: Option<String>) -> Result<()> {
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));

    client
        .send(Method::ShellStart { shell, rows, cols, env: HashMap::new() }, true)
        .await?;

    let _raw = RawMode::enable()?;
    let (mut reader, mut writer) = client.into_parts();

    // blocking stdin pump; the thread ends with the process
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(16);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let input_task = tokio::spawn(async move {
        while let Some(bytes) = stdin_rx.recv().await {
            let frame = Method::ShellData { data: b64::encode(&bytes) };
            if writer.send(frame, false).await.is_err() {
                break;
            }
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = loop {
        match reader.recv().await? {
            Some(response) => match response.result {
                Ok(ResponseData::ShellOutput { data }) => {
                    stdout.write_all(&b64::decode(&data)?)?;
                    stdout.flush()?;
                }
                Ok(ResponseData::StreamEnd) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(anyhow::anyhow!("shell session failed: {e}")),
            },
            // agent closed the connection
            None => break Ok(()),
        }
    };

    input_task.abort();
    outcome
}
