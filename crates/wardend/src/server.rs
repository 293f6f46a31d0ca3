//! TCP request dispatcher.
//!
//! Accepts connections, authenticates every request through the guard
//! (handshake excepted), and routes to the executor, file operations,
//! shell sessions, service control, and the update engine. Responses and
//! stream frames for one connection are funneled through a single writer
//! task so unary answers and stream chunks interleave safely.

use crate::auth::AuthError;
use crate::executor::{self, ExecError, ExecOptions};
use crate::fileops::FileOpError;
use crate::services;
use crate::shell::ShellSession;
use crate::state::DaemonState;
use crate::updater::UpdateError;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use warden_common::{
    b64, ActionResult, AuthResult, ErrorCode, Method, Request, Response, ResponseData, RpcError,
};

const RESPONSE_CHANNEL_DEPTH: usize = 64;
const AUTH_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Floor for the metrics stream; requests below it get the default.
const MIN_METRICS_INTERVAL_SECS: u32 = 1;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 2;

/// Bind and serve forever.
pub async fn run(state: Arc<DaemonState>, listen_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = listen_addr, "agent listening");
    serve(listener, state).await
}

/// Accept loop over an already-bound listener (tests bind their own).
pub async fn serve(listener: TcpListener, state: Arc<DaemonState>) -> Result<()> {
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTH_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.auth.sweep();
            }
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let identity = peer.ip().to_string();
                    debug!(peer = %identity, "connection opened");
                    if let Err(e) = handle_connection(stream, &identity, state).await {
                        debug!(peer = %identity, "connection ended: {e}");
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {e}");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    identity: &str,
    state: Arc<DaemonState>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_DEPTH);
    let writer = tokio::spawn(write_frames(write_half, rx));

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = identity, "invalid request frame: {e}");
                continue;
            }
        };
        let id = request.id;

        match request.method {
            Method::ShellStart { shell, rows, cols, env } => {
                if let Err(err) = authorize(&state, identity, request.token.as_deref()) {
                    if tx.send(Response::err(id, err)).await.is_err() {
                        break;
                    }
                    continue;
                }
                run_shell_session(&mut reader, &tx, id, shell, rows, cols, env).await;
                // the connection was dedicated to the session
                break;
            }
            method => {
                if let Some(response) =
                    dispatch(&state, identity, id, request.token.as_deref(), method, &tx).await
                {
                    if tx.send(response).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Serialize frames onto the socket. A write failure means the peer is
/// gone; dropping the receiver makes every pending sender fail, which is
/// how streaming tasks observe cancellation.
async fn write_frames(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<Response>) {
    while let Some(frame) = rx.recv().await {
        let mut json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to encode response: {e}");
                continue;
            }
        };
        json.push('\n');
        if half.write_all(json.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn authorize(state: &DaemonState, identity: &str, token: Option<&str>) -> Result<(), RpcError> {
    state.auth.authorize(identity, token).map_err(|e| match e {
        AuthError::LockedOut => RpcError::new(ErrorCode::ResourceExhausted, e.to_string()),
        other => RpcError::new(ErrorCode::Unauthenticated, other.to_string()),
    })
}

/// Route one request. Returns `None` when a streaming task now owns the
/// response channel for this id.
async fn dispatch(
    state: &Arc<DaemonState>,
    identity: &str,
    id: u64,
    token: Option<&str>,
    method: Method,
    tx: &mpsc::Sender<Response>,
) -> Option<Response> {
    // the handshake is the single guard-exempt method; it runs the same
    // guard logic itself and reports the outcome in-band
    if matches!(method, Method::Authenticate { .. }) {
        return Some(handle_authenticate(state, identity, id, token));
    }

    if let Err(err) = authorize(state, identity, token) {
        return Some(Response::err(id, err));
    }

    match method {
        Method::Authenticate { .. } | Method::ShellStart { .. } => Some(Response::err(
            id,
            RpcError::new(ErrorCode::InvalidArgument, "unexpected method"),
        )),

        Method::Ping => Some(Response::ok(id, ResponseData::Pong)),

        Method::GetSystemInfo => {
            let st = Arc::clone(state);
            let info = tokio::task::spawn_blocking(move || st.collector.system_info()).await;
            Some(match info {
                Ok(info) => Response::ok(id, ResponseData::System(info)),
                Err(e) => Response::err(id, RpcError::new(ErrorCode::Internal, e.to_string())),
            })
        }

        Method::GetMetrics { interval_seconds } => {
            let interval = if interval_seconds < MIN_METRICS_INTERVAL_SECS {
                DEFAULT_METRICS_INTERVAL_SECS
            } else {
                u64::from(interval_seconds)
            };
            let st = Arc::clone(state);
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval));
                // the immediate first tick; samples start one interval in
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let collect = Arc::clone(&st);
                    let sample =
                        match tokio::task::spawn_blocking(move || collect.collector.sample()).await
                        {
                            Ok(sample) => sample,
                            Err(_) => break,
                        };
                    if tx.send(Response::ok(id, ResponseData::Metrics(sample))).await.is_err() {
                        break;
                    }
                }
            });
            None
        }

        Method::ExecuteCommand { command, args, working_dir, env, timeout_seconds, sudo } => {
            let options = ExecOptions {
                working_dir,
                env,
                timeout: (timeout_seconds > 0).then(|| Duration::from_secs(timeout_seconds)),
                sudo,
            };
            Some(match executor::run(&state.commands, &command, &args, options).await {
                Ok(result) => Response::ok(id, ResponseData::Command(result)),
                Err(e) => Response::err(id, map_exec_error(e)),
            })
        }

        Method::ReadFile { path } => Some(match state.files.read_file(&path).await {
            Ok(content) => Response::ok(id, ResponseData::File(content)),
            Err(e) => Response::err(id, map_file_error(e)),
        }),

        Method::WriteFile { path, content, mode, create_dirs } => {
            Some(match b64::decode(&content) {
                Ok(bytes) => {
                    let action = state.files.write_file(&path, &bytes, mode, create_dirs).await;
                    Response::ok(id, ResponseData::Action(action))
                }
                Err(e) => Response::err(
                    id,
                    RpcError::new(ErrorCode::InvalidArgument, format!("bad file content: {e}")),
                ),
            })
        }

        Method::ListDirectory { path, recursive, show_hidden } => {
            Some(match state.files.list_directory(&path, recursive, show_hidden).await {
                Ok(listing) => Response::ok(id, ResponseData::Dir(listing)),
                Err(e) => Response::err(id, map_file_error(e)),
            })
        }

        Method::DeleteFile { path } => {
            let action = state.files.delete(&path).await;
            Some(Response::ok(id, ResponseData::Action(action)))
        }

        Method::TailLog { path, lines, follow } => {
            let st = Arc::clone(state);
            let tx = tx.clone();
            tokio::spawn(async move {
                let (line_tx, mut line_rx) = mpsc::channel(RESPONSE_CHANNEL_DEPTH);
                let files = st.files.clone();
                let tail =
                    tokio::spawn(
                        async move { files.tail_into(&path, lines, follow, line_tx).await },
                    );

                while let Some(content) = line_rx.recv().await {
                    let frame = Response::ok(
                        id,
                        ResponseData::LogLine {
                            content,
                            timestamp: chrono::Utc::now().timestamp(),
                        },
                    );
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }

                let outcome = match tail.await {
                    Ok(Ok(())) => Response::ok(id, ResponseData::StreamEnd),
                    Ok(Err(e)) => Response::err(id, map_file_error(e)),
                    Err(e) => Response::err(id, RpcError::new(ErrorCode::Internal, e.to_string())),
                };
                let _ = tx.send(outcome).await;
            });
            None
        }

        Method::ListServices { name_filter } => {
            Some(match services::list_services(name_filter.as_deref()).await {
                Ok(list) => Response::ok(id, ResponseData::Services(list)),
                Err(e) => Response::err(id, RpcError::new(ErrorCode::Internal, e.to_string())),
            })
        }

        Method::ServiceAction { name, action } => {
            let result = match services::service_action(&name, action).await {
                Ok(()) => ActionResult::ok("operation completed"),
                Err(e) => ActionResult::fail(e.to_string()),
            };
            Some(Response::ok(id, ResponseData::Action(result)))
        }

        Method::ListProcesses { name_filter, user_filter } => {
            let st = Arc::clone(state);
            let processes = tokio::task::spawn_blocking(move || {
                st.collector.processes(name_filter.as_deref(), user_filter.as_deref())
            })
            .await;
            Some(match processes {
                Ok(list) => Response::ok(id, ResponseData::Processes(list)),
                Err(e) => Response::err(id, RpcError::new(ErrorCode::Internal, e.to_string())),
            })
        }

        Method::KillProcess { pid, signal } => {
            let result = match services::kill_process(pid, signal) {
                Ok(()) => ActionResult::ok("signal delivered"),
                Err(e) => ActionResult::fail(e.to_string()),
            };
            Some(Response::ok(id, ResponseData::Action(result)))
        }

        Method::CheckUpdate => Some(match state.updater.check().await {
            Ok(info) => Response::ok(id, ResponseData::Update(info)),
            Err(e) => Response::err(id, map_update_error(e)),
        }),

        Method::DownloadUpdate { version } => {
            let updater = Arc::clone(&state.updater);
            let tx = tx.clone();
            tokio::spawn(async move {
                let (progress_tx, mut progress_rx) = mpsc::channel(16);
                let download =
                    tokio::spawn(async move { updater.download(&version, Some(progress_tx)).await });

                while let Some(progress) = progress_rx.recv().await {
                    if tx.send(Response::ok(id, ResponseData::Progress(progress))).await.is_err() {
                        // dropping the progress receiver cancels the download
                        break;
                    }
                }

                let outcome = match download.await {
                    Ok(Ok(_)) => Response::ok(id, ResponseData::StreamEnd),
                    Ok(Err(e)) => Response::err(id, map_update_error(e)),
                    Err(e) => Response::err(id, RpcError::new(ErrorCode::Internal, e.to_string())),
                };
                let _ = tx.send(outcome).await;
            });
            None
        }

        Method::ApplyUpdate { version } => Some(match state.updater.apply(&version).await {
            Ok(()) => Response::ok(
                id,
                ResponseData::Action(ActionResult::ok("update applied, restart scheduled")),
            ),
            Err(e) => Response::err(id, map_update_error(e)),
        }),

        Method::GetUpdateConfig => {
            Some(Response::ok(id, ResponseData::UpdateConfig(state.updater.config().await)))
        }

        Method::SetUpdateConfig { config } => Some(match state.updater.set_config(config).await {
            Ok(()) => Response::ok(id, ResponseData::Action(ActionResult::ok("config saved"))),
            Err(e) => Response::err(id, RpcError::new(ErrorCode::Internal, e.to_string())),
        }),

        Method::GetUpdateHistory => {
            Some(Response::ok(id, ResponseData::UpdateHistory(state.updater.history().await)))
        }

        Method::ShellData { .. } | Method::ShellResize { .. } => Some(Response::err(
            id,
            RpcError::new(ErrorCode::InvalidArgument, "no active shell session"),
        )),
    }
}

fn handle_authenticate(
    state: &DaemonState,
    identity: &str,
    id: u64,
    token: Option<&str>,
) -> Response {
    match state.auth.authorize(identity, token) {
        Ok(()) => {
            info!(peer = identity, "client authenticated");
            Response::ok(
                id,
                ResponseData::Auth(AuthResult {
                    success: true,
                    message: "authenticated".into(),
                    agent_version: state.version.clone(),
                    expires_at: chrono::Utc::now().timestamp() + 24 * 3600,
                }),
            )
        }
        Err(AuthError::LockedOut) => Response::err(
            id,
            RpcError::new(ErrorCode::ResourceExhausted, AuthError::LockedOut.to_string()),
        ),
        Err(e) => {
            warn!(peer = identity, "authentication failed: {e}");
            Response::ok(
                id,
                ResponseData::Auth(AuthResult {
                    success: false,
                    message: e.to_string(),
                    agent_version: state.version.clone(),
                    expires_at: 0,
                }),
            )
        }
    }
}

/// Drive one interactive shell session over this connection. Two paths
/// run concurrently until either side ends: PTY output forwarded to the
/// caller, and caller frames dispatched to the PTY. Teardown kills the
/// shell process and releases the PTY.
async fn run_shell_session(
    reader: &mut BufReader<OwnedReadHalf>,
    tx: &mpsc::Sender<Response>,
    id: u64,
    shell: Option<String>,
    rows: u16,
    cols: u16,
    env: HashMap<String, String>,
) {
    let mut session = match ShellSession::spawn(shell.as_deref(), rows, cols, &env) {
        Ok(session) => session,
        Err(e) => {
            let _ = tx
                .send(Response::err(
                    id,
                    RpcError::new(ErrorCode::Internal, format!("failed to start shell: {e}")),
                ))
                .await;
            return;
        }
    };

    let Some(mut output) = session.take_output() else {
        return;
    };

    let out_tx = tx.clone();
    let mut forward = tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            let frame = Response::ok(id, ResponseData::ShellOutput { data: b64::encode(&chunk) });
            if out_tx.send(frame).await.is_err() {
                return;
            }
        }
        let _ = out_tx.send(Response::ok(id, ResponseData::StreamEnd)).await;
    });

    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            // PTY end-of-stream (or caller unreachable): session is over
            _ = &mut forward => break,
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let frame = line.trim();
                if frame.is_empty() {
                    continue;
                }
                let request: Request = match serde_json::from_str(frame) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("invalid shell frame: {e}");
                        continue;
                    }
                };
                match request.method {
                    Method::ShellData { data } => match b64::decode(&data) {
                        Ok(bytes) => {
                            if let Err(e) = session.write(&bytes) {
                                warn!("shell write failed: {e}");
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Response::err(
                                    request.id,
                                    RpcError::new(
                                        ErrorCode::InvalidArgument,
                                        format!("bad shell data: {e}"),
                                    ),
                                ))
                                .await;
                        }
                    },
                    Method::ShellResize { rows, cols } => {
                        if let Err(e) = session.resize(rows, cols) {
                            warn!("shell resize failed: {e}");
                        }
                    }
                    _ => {
                        let _ = tx
                            .send(Response::err(
                                request.id,
                                RpcError::new(
                                    ErrorCode::InvalidArgument,
                                    "connection is dedicated to a shell session",
                                ),
                            ))
                            .await;
                    }
                }
            }
        }
    }

    session.close();
    forward.abort();
}

fn map_exec_error(e: ExecError) -> RpcError {
    match e {
        ExecError::Policy(p) => RpcError::new(ErrorCode::PolicyViolation, p.to_string()),
        ExecError::Timeout(_) => RpcError::new(ErrorCode::ExecutionFailed, e.to_string()),
        ExecError::Spawn(_) | ExecError::Io(_) => {
            RpcError::new(ErrorCode::ExecutionFailed, e.to_string())
        }
    }
}

fn map_file_error(e: FileOpError) -> RpcError {
    match e {
        FileOpError::Policy(p) => RpcError::new(ErrorCode::PolicyViolation, p.to_string()),
        FileOpError::NotFound(_) => RpcError::new(ErrorCode::NotFound, e.to_string()),
        FileOpError::Io(_) | FileOpError::Internal(_) => {
            RpcError::new(ErrorCode::Internal, e.to_string())
        }
    }
}

fn map_update_error(e: UpdateError) -> RpcError {
    match e {
        UpdateError::ChecksumMismatch => RpcError::new(ErrorCode::IntegrityError, e.to_string()),
        UpdateError::StagedMissing(_) | UpdateError::VersionUnavailable(_) => {
            RpcError::new(ErrorCode::NotFound, e.to_string())
        }
        UpdateError::Server(_)
        | UpdateError::Http(_)
        | UpdateError::Cancelled
        | UpdateError::Io(_) => RpcError::new(ErrorCode::Internal, e.to_string()),
    }
}
