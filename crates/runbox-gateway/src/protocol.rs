//! Gateway HTTP protocol — JSON bodies of the tool endpoints
//!
//! Every response carries a `text` field: a one-paragraph summary meant to be
//! shown verbatim to whoever drives the tools.

use runbox_core::files::DirEntry;
use runbox_core::{ExecOutcome, ExposedService, Sandbox, SessionInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Requests ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    /// Recreate under this ID instead of generating one
    #[serde(default)]
    pub sandbox_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub sandbox_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandRequest {
    pub sandbox_id: String,
    pub command: String,
    /// Milliseconds to wait before returning a partial result
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollCommandRequest {
    pub session_id: String,
    /// Milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposePortRequest {
    pub sandbox_id: String,
    /// Port a service already listens on; omitted to have one allocated
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    /// Empty or omitted creates a fresh sandbox first
    #[serde(default)]
    pub sandbox_id: Option<String>,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub sandbox_id: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

pub fn timeout_from_millis(millis: Option<u64>) -> Option<Duration> {
    millis.map(Duration::from_millis)
}

// ── Responses ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub sandbox_id: String,
    /// Editor URL
    pub url: String,
    pub sandbox: Sandbox,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorUrlResponse {
    pub sandbox_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    #[serde(flatten)]
    pub outcome: ExecOutcome,
    pub text: String,
}

impl CommandResponse {
    pub fn new(outcome: ExecOutcome, timeout: Duration) -> Self {
        let text = match &outcome {
            ExecOutcome::Completed { output, .. } if output.is_empty() => {
                "Command finished with no output".to_string()
            }
            ExecOutcome::Completed { output, .. } => output.clone(),
            ExecOutcome::TimedOut {
                session_id,
                partial,
            } => format!(
                "Command not finished after {:.1}s. Poll session {} for the rest. Output so far:\n{}",
                timeout.as_secs_f64(),
                session_id,
                partial
            ),
        };
        Self { outcome, text }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposePortResponse {
    #[serde(flatten)]
    pub service: ExposedService,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasePortResponse {
    pub sandbox_id: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResponse {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileResponse {
    pub sandbox_id: String,
    pub path: String,
    /// Set when the write created the sandbox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_sandbox_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryResponse {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxList {
    pub sandboxes: Vec<Sandbox>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub text: String,
}

impl StatusResponse {
    pub fn new(status: &str, text: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            text: text.into(),
        }
    }
}

/// Body of every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
