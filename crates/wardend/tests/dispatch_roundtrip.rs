//! End-to-end tests over a real TCP connection: the framed protocol, the
//! auth guard in front of every method, policy enforcement, file
//! operations, streaming, and the interactive shell.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use warden_common::{b64, ErrorCode, Method, Request, Response, ResponseData};
use wardend::auth::AuthGuard;
use wardend::security::SecurityConfig;
use wardend::server;
use wardend::state::DaemonState;
use wardend::updater::Updater;

const TOKEN: &str = "integration-test-token-0123456789abcdef";

async fn start_agent(security: SecurityConfig) -> (std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let auth = AuthGuard::new(Some(TOKEN.to_string())).unwrap();
    let updater = Arc::new(
        Updater::new("0.0.0-test", dir.path(), "http://127.0.0.1:0", "wardend").unwrap(),
    );
    let state =
        Arc::new(DaemonState::new("0.0.0-test", auth, Arc::new(security), updater).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::serve(listener, state).await;
    });
    (addr, dir)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self { reader: BufReader::new(read_half), writer: write_half, next_id: 0 }
    }

    async fn send(&mut self, token: Option<&str>, method: Method) -> u64 {
        self.next_id += 1;
        let request = Request {
            id: self.next_id,
            token: token.map(str::to_string),
            method,
        };
        let mut frame = serde_json::to_string(&request).unwrap();
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await.unwrap();
        self.next_id
    }

    async fn recv(&mut self) -> Response {
        let mut line = String::new();
        let deadline = Duration::from_secs(15);
        tokio::time::timeout(deadline, self.reader.read_line(&mut line))
            .await
            .expect("response within deadline")
            .unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    async fn call(&mut self, token: Option<&str>, method: Method) -> Response {
        self.send(token, method).await;
        self.recv().await
    }
}

#[tokio::test]
async fn authenticate_then_ping() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    let response = client
        .call(Some(TOKEN), Method::Authenticate { client_version: "test".into() })
        .await;
    match response.result.unwrap() {
        ResponseData::Auth(auth) => {
            assert!(auth.success);
            assert_eq!(auth.agent_version, "0.0.0-test");
            assert!(auth.expires_at > chrono::Utc::now().timestamp());
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let response = client.call(Some(TOKEN), Method::Ping).await;
    assert!(matches!(response.result.unwrap(), ResponseData::Pong));
}

#[tokio::test]
async fn bearer_prefixed_token_is_accepted() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    let bearer = format!("Bearer {TOKEN}");
    let response = client.call(Some(&bearer), Method::Ping).await;
    assert!(matches!(response.result.unwrap(), ResponseData::Pong));
}

#[tokio::test]
async fn requests_without_token_are_unauthenticated() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    let response = client.call(None, Method::Ping).await;
    let err = response.result.unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthenticated);
}

#[tokio::test]
async fn lockout_rejects_even_the_correct_token() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    for attempt in 1..=5u32 {
        let response = client
            .call(
                Some("wrong-token-wrong-token-wrong-000"),
                Method::Authenticate { client_version: "test".into() },
            )
            .await;
        if attempt < 5 {
            match response.result.unwrap() {
                ResponseData::Auth(auth) => assert!(!auth.success),
                other => panic!("unexpected response: {other:?}"),
            }
        } else {
            // the attempt that reaches the maximum imposes the lockout
            assert_eq!(response.result.unwrap_err().code, ErrorCode::ResourceExhausted);
        }
    }

    let response = client.call(Some(TOKEN), Method::Ping).await;
    assert_eq!(response.result.unwrap_err().code, ErrorCode::ResourceExhausted);
}

#[tokio::test]
async fn execute_command_round_trip() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    let response = client
        .call(
            Some(TOKEN),
            Method::ExecuteCommand {
                command: "echo".into(),
                args: vec!["over-the-wire".into()],
                working_dir: None,
                env: Default::default(),
                timeout_seconds: 10,
                sudo: false,
            },
        )
        .await;

    match response.result.unwrap() {
        ResponseData::Command(result) => {
            assert_eq!(result.exit_code, 0);
            assert_eq!(result.stdout.trim(), "over-the-wire");
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn whitelist_rejects_unlisted_commands_end_to_end() {
    let security = SecurityConfig {
        enable_command_whitelist: true,
        command_whitelist: vec!["ls".into(), "cat".into()],
        ..Default::default()
    };
    let (addr, _dir) = start_agent(security).await;
    let mut client = Client::connect(addr).await;

    // `rm` with a harmless argument: no injection characters, no
    // dangerous-list match; the whitelist alone rejects it
    let response = client
        .call(
            Some(TOKEN),
            Method::ExecuteCommand {
                command: "rm".into(),
                args: vec!["somefile".into()],
                working_dir: None,
                env: Default::default(),
                timeout_seconds: 10,
                sudo: false,
            },
        )
        .await;
    let err = response.result.unwrap_err();
    assert_eq!(err.code, ErrorCode::PolicyViolation);
    assert!(err.message.contains("rm"));

    let response = client
        .call(
            Some(TOKEN),
            Method::ExecuteCommand {
                command: "ls".into(),
                args: vec!["/".into()],
                working_dir: None,
                env: Default::default(),
                timeout_seconds: 10,
                sudo: false,
            },
        )
        .await;
    assert!(matches!(response.result.unwrap(), ResponseData::Command(_)));
}

#[tokio::test]
async fn file_operations_round_trip_in_sandbox() {
    let (addr, dir) = start_agent(SecurityConfig::default()).await;
    // the state's tempdir is for updater data; use a path under /tmp for
    // file operations, which the default policy allows
    let sandbox = tempfile::Builder::new().prefix("wardend-wire").tempdir_in("/tmp").unwrap();
    let file_path = sandbox.path().join("hello.txt").to_string_lossy().to_string();
    let mut client = Client::connect(addr).await;

    let response = client
        .call(
            Some(TOKEN),
            Method::WriteFile {
                path: file_path.clone(),
                content: b64::encode(b"wire bytes"),
                mode: 0o644,
                create_dirs: false,
            },
        )
        .await;
    match response.result.unwrap() {
        ResponseData::Action(action) => assert!(action.success, "{}", action.error),
        other => panic!("unexpected response: {other:?}"),
    }

    let response = client.call(Some(TOKEN), Method::ReadFile { path: file_path.clone() }).await;
    match response.result.unwrap() {
        ResponseData::File(file) => {
            assert_eq!(b64::decode(&file.content).unwrap(), b"wire bytes");
            assert_eq!(file.info.name, "hello.txt");
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let response = client.call(Some(TOKEN), Method::DeleteFile { path: file_path }).await;
    match response.result.unwrap() {
        ResponseData::Action(action) => assert!(action.success, "{}", action.error),
        other => panic!("unexpected response: {other:?}"),
    }

    // reading a forbidden path is a policy violation, not a transport fault
    let response =
        client.call(Some(TOKEN), Method::ReadFile { path: "/etc/shadow".into() }).await;
    assert_eq!(response.result.unwrap_err().code, ErrorCode::PolicyViolation);

    drop(dir);
}

#[tokio::test]
async fn tail_log_streams_backlog_then_ends() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let sandbox = tempfile::Builder::new().prefix("wardend-tail").tempdir_in("/tmp").unwrap();
    let log_path = sandbox.path().join("app.log");
    std::fs::write(&log_path, "alpha\nbeta\ngamma\n").unwrap();

    let mut client = Client::connect(addr).await;
    client
        .send(
            Some(TOKEN),
            Method::TailLog {
                path: log_path.to_string_lossy().to_string(),
                lines: 2,
                follow: false,
            },
        )
        .await;

    let mut lines = Vec::new();
    loop {
        let response = client.recv().await;
        match response.result.unwrap() {
            ResponseData::LogLine { content, .. } => lines.push(content),
            ResponseData::StreamEnd => break,
            other => panic!("unexpected response: {other:?}"),
        }
    }
    assert_eq!(lines, vec!["beta", "gamma"]);
}

#[tokio::test]
async fn metrics_stream_delivers_samples() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    client.send(Some(TOKEN), Method::GetMetrics { interval_seconds: 1 }).await;

    let response = client.recv().await;
    match response.result.unwrap() {
        ResponseData::Metrics(sample) => {
            assert!(sample.timestamp > 0);
            assert!(sample.memory_usage >= 0.0);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn shell_data_without_session_is_rejected() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    let response = client
        .call(Some(TOKEN), Method::ShellData { data: b64::encode(b"ls\n") })
        .await;
    assert_eq!(response.result.unwrap_err().code, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn interactive_shell_over_the_wire() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    client
        .send(
            Some(TOKEN),
            Method::ShellStart {
                shell: Some("/bin/sh".into()),
                rows: 24,
                cols: 80,
                env: Default::default(),
            },
        )
        .await;
    client.send(None, Method::ShellData { data: b64::encode(b"echo wire-$((40+2))\n") }).await;

    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline {
        let response = client.recv().await;
        match response.result.unwrap() {
            ResponseData::ShellOutput { data } => {
                collected.push_str(&String::from_utf8_lossy(&b64::decode(&data).unwrap()));
                if collected.contains("wire-42") {
                    break;
                }
            }
            ResponseData::StreamEnd => break,
            other => panic!("unexpected response: {other:?}"),
        }
    }
    assert!(collected.contains("wire-42"), "shell output was: {collected:?}");
}

#[tokio::test]
async fn update_config_round_trip_over_the_wire() {
    let (addr, _dir) = start_agent(SecurityConfig::default()).await;
    let mut client = Client::connect(addr).await;

    let config = warden_common::UpdateConfig {
        auto_update: false,
        check_interval: 1800,
        channel: warden_common::UpdateChannel::Beta,
        last_check: None,
        notify_only: true,
    };
    let response =
        client.call(Some(TOKEN), Method::SetUpdateConfig { config: config.clone() }).await;
    match response.result.unwrap() {
        ResponseData::Action(action) => assert!(action.success),
        other => panic!("unexpected response: {other:?}"),
    }

    let response = client.call(Some(TOKEN), Method::GetUpdateConfig).await;
    match response.result.unwrap() {
        ResponseData::UpdateConfig(loaded) => {
            assert_eq!(loaded.check_interval, 1800);
            assert_eq!(loaded.channel, warden_common::UpdateChannel::Beta);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let response = client.call(Some(TOKEN), Method::GetUpdateHistory).await;
    match response.result.unwrap() {
        ResponseData::UpdateHistory(history) => assert!(history.is_empty()),
        other => panic!("unexpected response: {other:?}"),
    }
}
