//! Wire protocol between clients and the warden agent.
//!
//! Frames are newline-delimited JSON over a TCP connection. A unary call is
//! one `Request` answered by one `Response`. A streaming call is one
//! `Request` answered by a series of `Response` frames sharing the request
//! id, closed by `ResponseData::StreamEnd` (or an error). The interactive
//! shell dedicates the connection: after `Method::ShellStart` the client
//! keeps sending `ShellData`/`ShellResize` frames with the same id while
//! the agent interleaves `ShellOutput` frames.

use crate::types::{
    CommandResult, DirListing, FileContent, MetricsSample, ProcessInfo, ServiceInfo, SystemInfo,
};
use crate::update::{DownloadProgress, UpdateConfig, UpdateInfo, UpdateRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request from client to agent.
///
/// The credential rides on every request (plain or `Bearer `-prefixed);
/// only `Method::Authenticate` is processed without a prior guard check.
/// Follow-up frames of an already-established shell session
/// (`ShellData`/`ShellResize`) belong to the gated call that started it and
/// carry no token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub method: Method,
}

/// Response from agent to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, RpcError>,
}

impl Response {
    pub fn ok(id: u64, data: ResponseData) -> Self {
        Self { id, result: Ok(data) }
    }

    pub fn err(id: u64, error: RpcError) -> Self {
        Self { id, result: Err(error) }
    }
}

/// Error taxonomy carried on the wire.
///
/// `ResourceExhausted` is the lockout signal and is deliberately distinct
/// from `Unauthenticated` so clients can back off instead of retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    ResourceExhausted,
    PolicyViolation,
    InvalidArgument,
    NotFound,
    ExecutionFailed,
    IntegrityError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::PolicyViolation => "policy_violation",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::IntegrityError => "integrity_error",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{}: {message}", .code.as_str())]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Service lifecycle verbs accepted by `Method::ServiceAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOp {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl ServiceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceOp::Start => "start",
            ServiceOp::Stop => "stop",
            ServiceOp::Restart => "restart",
            ServiceOp::Enable => "enable",
            ServiceOp::Disable => "disable",
        }
    }
}

/// Request methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Method {
    /// Credential handshake. The only method the guard does not pre-check.
    Authenticate {
        #[serde(default)]
        client_version: String,
    },

    /// Health probe.
    Ping,

    /// Static system inventory.
    GetSystemInfo,

    /// Stream of metric samples, one per interval.
    GetMetrics {
        #[serde(default)]
        interval_seconds: u32,
    },

    /// Run one bounded command to completion.
    ExecuteCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        timeout_seconds: u64,
        #[serde(default)]
        sudo: bool,
    },

    /// Open an interactive shell session on this connection.
    ShellStart {
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        rows: u16,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        env: HashMap<String, String>,
    },

    /// Raw bytes for the running shell session (base64).
    ShellData { data: String },

    /// Apply a new terminal size to the running shell session.
    ShellResize { rows: u16, cols: u16 },

    ReadFile {
        path: String,
    },

    WriteFile {
        path: String,
        /// File content, base64-encoded.
        content: String,
        #[serde(default)]
        mode: u32,
        #[serde(default)]
        create_dirs: bool,
    },

    ListDirectory {
        path: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default)]
        show_hidden: bool,
    },

    DeleteFile {
        path: String,
    },

    /// Last N lines of a file, optionally following appended data.
    TailLog {
        path: String,
        #[serde(default)]
        lines: u32,
        #[serde(default)]
        follow: bool,
    },

    ListServices {
        #[serde(default)]
        name_filter: Option<String>,
    },

    ServiceAction {
        name: String,
        action: ServiceOp,
    },

    ListProcesses {
        #[serde(default)]
        name_filter: Option<String>,
        #[serde(default)]
        user_filter: Option<String>,
    },

    KillProcess {
        pid: i32,
        #[serde(default)]
        signal: i32,
    },

    CheckUpdate,

    /// Stream of download progress frames for a staged release artifact.
    DownloadUpdate {
        version: String,
    },

    ApplyUpdate {
        version: String,
    },

    GetUpdateConfig,

    SetUpdateConfig {
        config: UpdateConfig,
    },

    GetUpdateHistory,
}

/// Outcome of the credential handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    pub message: String,
    pub agent_version: String,
    /// Advisory expiry (unix seconds); the token itself does not rotate.
    pub expires_at: i64,
}

/// Structured success/failure shape for mutating operations.
///
/// Filesystem and service-action failures are data, not transport faults:
/// the caller always receives this defined shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: String,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), error: String::new() }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, message: String::new(), error: error.into() }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseData {
    Pong,
    Auth(AuthResult),
    System(SystemInfo),
    Metrics(MetricsSample),
    Command(CommandResult),
    /// Raw shell output bytes (base64).
    ShellOutput { data: String },
    File(FileContent),
    Dir(DirListing),
    Action(ActionResult),
    LogLine { content: String, timestamp: i64 },
    Services(Vec<ServiceInfo>),
    Processes(Vec<ProcessInfo>),
    Update(UpdateInfo),
    Progress(DownloadProgress),
    UpdateConfig(UpdateConfig),
    UpdateHistory(Vec<UpdateRecord>),
    /// Terminates a streaming call.
    StreamEnd,
}
