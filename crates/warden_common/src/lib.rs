//! Shared types for the warden agent and its operator CLI.
//!
//! Everything that crosses the wire lives here: the framed request/response
//! protocol, the data shapes it carries, and the update metadata that is
//! also persisted on the agent side.

pub mod protocol;
pub mod types;
pub mod update;

pub use protocol::{
    ActionResult, AuthResult, ErrorCode, Method, Request, Response, ResponseData, RpcError,
    ServiceOp,
};
pub use types::{
    CommandResult, CpuInfo, DirListing, DiskInfo, DiskMetric, FileContent, FileInfo, MemoryInfo,
    MetricsSample, NetworkInfo, NetworkMetric, ProcessInfo, ServiceInfo, SystemInfo,
};
pub use update::{
    DownloadPhase, DownloadProgress, UpdateChannel, UpdateConfig, UpdateInfo, UpdateRecord,
};

/// Base64 helpers for binary payloads carried inside JSON frames.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(s)
    }
}
