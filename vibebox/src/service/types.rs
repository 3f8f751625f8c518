//! Public request/response types for the service façade.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::IoStreams;
use crate::config::Provider;
use crate::images::catalog::Descriptor;

/// One official white-listed VM image, as exposed to embedders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub arch: String,
    pub url: String,
    pub size_bytes: u64,
}

impl From<&Descriptor> for Image {
    fn from(desc: &Descriptor) -> Self {
        Image {
            id: desc.id.to_string(),
            display_name: desc.display_name.to_string(),
            version: desc.version.to_string(),
            arch: desc.arch.to_string(),
            url: desc.url.to_string(),
            size_bytes: desc.size_bytes,
        }
    }
}

/// Event emitted during long-running operations.
#[derive(Debug, Clone, Default)]
pub struct ServiceEvent {
    pub kind: String,
    pub phase: String,
    pub message: String,
    pub percent: f64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub speed_bps: f64,
    pub eta: Option<Duration>,
    pub error: Option<String>,
    pub done: bool,
}

impl ServiceEvent {
    pub(crate) fn simple(kind: &str, message: impl Into<String>) -> Self {
        ServiceEvent {
            kind: kind.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Receives operation events.
pub type EventHandler = Arc<dyn Fn(ServiceEvent) + Send + Sync>;

/// Availability status of one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDiagnostic {
    pub available: bool,
    pub reason: String,
    pub fix_hints: Vec<String>,
}

/// Project initialization inputs.
#[derive(Default)]
pub struct InitializeRequest {
    pub project_root: Option<PathBuf>,
    /// Defaults to the first official image for the host architecture.
    pub image_id: Option<String>,
    pub provider: Option<Provider>,
    pub cpus: Option<u32>,
    pub ram_mb: Option<u64>,
    pub disk_gb: Option<u32>,
    pub provision_script: Option<String>,
    pub no_default_mounts: bool,
    pub mounts: Vec<crate::config::Mount>,
    pub on_event: Option<EventHandler>,
}

/// Artifacts produced by initialization.
#[derive(Debug, Clone)]
pub struct InitializeResult {
    pub project_root: PathBuf,
    pub config_path: PathBuf,
    pub image: Image,
    pub base_raw_path: PathBuf,
}

/// Probe outcome: selection plus the full diagnostics map. `selected` is
/// `None` (and `error` is set) when no backend satisfied the request;
/// diagnostics stay populated either way.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub selected: Option<Provider>,
    pub was_fallback: bool,
    pub fallback_from: String,
    pub diagnostics: HashMap<String, BackendDiagnostic>,
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Interactive sandbox startup inputs.
#[derive(Default)]
pub struct StartRequest {
    pub project_root: Option<PathBuf>,
    pub provider_override: Option<Provider>,
    pub io: IoStreams,
    pub on_event: Option<EventHandler>,
}

/// Startup decision details.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub selected: Provider,
    pub was_fallback: bool,
    pub fallback_from: String,
    pub diagnostics: HashMap<String, BackendDiagnostic>,
}

/// Non-interactive command execution inputs.
#[derive(Default)]
pub struct ExecRequest {
    pub project_root: Option<PathBuf>,
    pub provider_override: Option<Provider>,
    pub command: String,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub timeout_seconds: u64,
    pub on_event: Option<EventHandler>,
}

/// Deterministic output for one command execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub selected: Provider,
    pub diagnostics: HashMap<String, BackendDiagnostic>,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Stopped => "stopped",
        }
    }
}

/// Service-level reusable sandbox session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub selected: Provider,
    pub diagnostics: HashMap<String, BackendDiagnostic>,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

/// Session creation inputs.
#[derive(Default)]
pub struct StartSessionRequest {
    pub project_root: Option<PathBuf>,
    pub provider_override: Option<Provider>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub on_event: Option<EventHandler>,
}

/// Session command execution inputs.
#[derive(Default)]
pub struct ExecInSessionRequest {
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub timeout_seconds: u64,
    pub on_event: Option<EventHandler>,
}

/// Session stop inputs.
#[derive(Default)]
pub struct StopSessionRequest {
    pub session_id: String,
    pub on_event: Option<EventHandler>,
}
