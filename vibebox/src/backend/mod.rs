//! Backend abstraction: one sandbox runtime implementation per provider.

use std::any::Any;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::errors::VibeboxResult;

pub mod applevm;
pub mod docker;
pub mod off;
pub mod selector;

pub use selector::{select, Selection};

/// Stdio binding for interactive sessions. `None` streams inherit the
/// process's own stdin/stdout/stderr.
#[derive(Default)]
pub struct IoStreams {
    pub stdin: Option<Box<dyn Read + Send>>,
    pub stdout: Option<Box<dyn Write + Send>>,
    pub stderr: Option<Box<dyn Write + Send>>,
}

/// Runtime inputs for one backend invocation.
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub project_root: PathBuf,
    pub project_name: String,
    pub config: Config,
    /// Extracted flat disk image shared across projects (may be empty when
    /// the project was never initialized).
    pub base_raw_path: PathBuf,
    /// Project-local mutable clone of the base raw, retained across
    /// invocations to preserve provisioning.
    pub instance_raw_path: PathBuf,
}

/// One non-interactive command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: String,
    pub env: HashMap<String, String>,
    /// Zero means the backend default (10 minutes for apple-vm, unlimited
    /// for off/docker).
    pub timeout: Duration,
}

/// Deterministic output of one command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Backend availability report.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub available: bool,
    pub reason: String,
    pub fix_hints: Vec<String>,
}

impl ProbeResult {
    pub fn available() -> Self {
        Self {
            available: true,
            ..Default::default()
        }
    }

    pub fn unavailable(reason: impl Into<String>, hints: &[&str]) -> Self {
        Self {
            available: false,
            reason: reason.into(),
            fix_hints: hints.iter().map(|h| h.to_string()).collect(),
        }
    }
}

/// Inputs for creating a reusable session on a backend.
#[derive(Debug, Clone, Default)]
pub struct SessionStartRequest {
    pub session_id: String,
    pub cwd: String,
    pub env: HashMap<String, String>,
}

/// Backend-specific opaque session state, downcast by its owner.
pub type SessionHandle = Arc<dyn Any + Send + Sync>;

/// One sandbox runtime implementation.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Report whether this backend can run on the current host, with
    /// actionable hints when it cannot.
    async fn probe(&self) -> ProbeResult;

    /// Make the backend ready for `start`/`exec` (pull images, build the
    /// instance disk). Idempotent.
    async fn prepare(&self, spec: &RuntimeSpec) -> VibeboxResult<()>;

    /// Run an interactive shell wired to the given stdio.
    async fn start(&self, spec: &RuntimeSpec, io: IoStreams) -> VibeboxResult<()>;

    /// Run one command and recover stdout, stderr, and exit code.
    async fn exec(&self, spec: &RuntimeSpec, req: ExecRequest) -> VibeboxResult<ExecResult>;

    /// Session support is an optional capability; backends that keep
    /// per-session state return themselves here.
    fn as_session_backend(&self) -> Option<&dyn SessionBackend> {
        None
    }
}

/// Optional per-session capability of a [`Backend`].
#[async_trait]
pub trait SessionBackend: Backend {
    async fn start_session(
        &self,
        spec: &RuntimeSpec,
        req: SessionStartRequest,
    ) -> VibeboxResult<SessionHandle>;

    async fn exec_in_session(
        &self,
        spec: &RuntimeSpec,
        handle: &SessionHandle,
        req: ExecRequest,
    ) -> VibeboxResult<ExecResult>;

    async fn stop_session(&self, spec: &RuntimeSpec, handle: &SessionHandle) -> VibeboxResult<()>;
}

/// Merge request env over session defaults.
pub(crate) fn merge_env(
    defaults: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut out = defaults.clone();
    for (k, v) in overrides {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// Run an interactive child process against the given stdio. Inherited
/// streams hand the terminal straight to the child; custom streams are
/// pumped through pipes on dedicated threads.
pub(crate) async fn run_interactive(
    mut cmd: std::process::Command,
    io: IoStreams,
) -> VibeboxResult<std::process::ExitStatus> {
    use std::process::Stdio;

    tokio::task::spawn_blocking(move || -> VibeboxResult<std::process::ExitStatus> {
        let IoStreams {
            stdin,
            stdout,
            stderr,
        } = io;

        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        cmd.stdout(if stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        cmd.stderr(if stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        let mut child = cmd.spawn()?;

        let mut pumps = Vec::new();
        if let (Some(mut reader), Some(mut child_in)) = (stdin, child.stdin.take()) {
            pumps.push(std::thread::spawn(move || {
                let _ = std::io::copy(&mut reader, &mut child_in);
            }));
        }
        if let (Some(mut writer), Some(mut child_out)) = (stdout, child.stdout.take()) {
            pumps.push(std::thread::spawn(move || {
                let _ = std::io::copy(&mut child_out, &mut writer);
            }));
        }
        if let (Some(mut writer), Some(mut child_err)) = (stderr, child.stderr.take()) {
            pumps.push(std::thread::spawn(move || {
                let _ = std::io::copy(&mut child_err, &mut writer);
            }));
        }

        let status = child.wait()?;
        for pump in pumps {
            let _ = pump.join();
        }
        Ok(status)
    })
    .await
    .map_err(|e| crate::errors::VibeboxError::Internal(format!("interactive task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_env_request_wins() {
        let mut defaults = HashMap::new();
        defaults.insert("A".to_string(), "1".to_string());
        defaults.insert("B".to_string(), "2".to_string());
        let mut overrides = HashMap::new();
        overrides.insert("B".to_string(), "3".to_string());

        let merged = merge_env(&defaults, &overrides);
        assert_eq!(merged["A"], "1");
        assert_eq!(merged["B"], "3");
    }

    #[test]
    fn test_probe_result_constructors() {
        assert!(ProbeResult::available().available);
        let missing = ProbeResult::unavailable("nope", &["do the thing"]);
        assert!(!missing.available);
        assert_eq!(missing.fix_hints, vec!["do the thing"]);
    }
}
