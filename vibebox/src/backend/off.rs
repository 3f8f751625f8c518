//! Host-local fallback backend.
//!
//! Commands run directly on the host under `/bin/bash -lc` with a fixed
//! environment allow-list and a cwd jail rooted at the project.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backend::{
    merge_env, run_interactive, Backend, ExecRequest, ExecResult, IoStreams, ProbeResult,
    RuntimeSpec, SessionBackend, SessionHandle, SessionStartRequest,
};
use crate::errors::{VibeboxError, VibeboxResult};
use crate::util::normalize_path;

/// Environment variables forwarded from the host. Fixed by design; request
/// env overrides individual entries but cannot widen the list implicitly.
const ENV_ALLOW_LIST: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TMPDIR"];

pub struct OffBackend;

struct OffSessionHandle {
    cwd: PathBuf,
    env: HashMap<String, String>,
}

impl OffBackend {
    pub fn new() -> Self {
        OffBackend
    }
}

impl Default for OffBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for OffBackend {
    fn name(&self) -> &'static str {
        "off"
    }

    async fn probe(&self) -> ProbeResult {
        if !Path::new("/bin/bash").exists() {
            return ProbeResult::unavailable(
                "/bin/bash not found",
                &["install bash or configure shell path"],
            );
        }
        ProbeResult::available()
    }

    async fn prepare(&self, _spec: &RuntimeSpec) -> VibeboxResult<()> {
        Ok(())
    }

    async fn start(&self, spec: &RuntimeSpec, io: IoStreams) -> VibeboxResult<()> {
        let mut cmd = std::process::Command::new("/bin/bash");
        cmd.current_dir(&spec.project_root);
        let status = run_interactive(cmd, io).await?;
        if !status.success() {
            tracing::debug!(?status, "interactive shell exited non-zero");
        }
        Ok(())
    }

    async fn exec(&self, spec: &RuntimeSpec, req: ExecRequest) -> VibeboxResult<ExecResult> {
        let host_cwd = resolve_host_cwd(&spec.project_root, &req.cwd)?;

        let mut cmd = tokio::process::Command::new("/bin/bash");
        cmd.arg("-lc")
            .arg(&req.command)
            .current_dir(&host_cwd)
            .env_clear()
            .envs(restricted_env(&req.env))
            .kill_on_drop(true);

        let output = cmd.output().await?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn as_session_backend(&self) -> Option<&dyn SessionBackend> {
        Some(self)
    }
}

#[async_trait]
impl SessionBackend for OffBackend {
    async fn start_session(
        &self,
        spec: &RuntimeSpec,
        req: SessionStartRequest,
    ) -> VibeboxResult<SessionHandle> {
        let cwd = resolve_host_cwd(&spec.project_root, &req.cwd)?;
        Ok(std::sync::Arc::new(OffSessionHandle {
            cwd,
            env: req.env,
        }))
    }

    async fn exec_in_session(
        &self,
        spec: &RuntimeSpec,
        handle: &SessionHandle,
        req: ExecRequest,
    ) -> VibeboxResult<ExecResult> {
        let handle = handle
            .downcast_ref::<OffSessionHandle>()
            .ok_or_else(|| VibeboxError::Internal("invalid off session handle".into()))?;

        let cwd = if req.cwd.is_empty() {
            handle.cwd.display().to_string()
        } else {
            req.cwd
        };
        self.exec(
            spec,
            ExecRequest {
                command: req.command,
                cwd,
                env: merge_env(&handle.env, &req.env),
                timeout: req.timeout,
            },
        )
        .await
    }

    async fn stop_session(
        &self,
        _spec: &RuntimeSpec,
        _handle: &SessionHandle,
    ) -> VibeboxResult<()> {
        Ok(())
    }
}

/// Resolve the requested cwd against the project root, rejecting escapes.
/// The result must exist and be a directory.
fn resolve_host_cwd(project_root: &Path, requested: &str) -> VibeboxResult<PathBuf> {
    if requested.is_empty() {
        return Ok(project_root.to_path_buf());
    }

    let host = if Path::new(requested).is_absolute() {
        normalize_path(Path::new(requested))
    } else {
        normalize_path(&project_root.join(requested))
    };

    let root = normalize_path(project_root);
    if host.strip_prefix(&root).is_err() {
        return Err(VibeboxError::PathEscape {
            path: host.display().to_string(),
            root: root.display().to_string(),
        });
    }

    let meta = std::fs::metadata(&host)?;
    if !meta.is_dir() {
        return Err(VibeboxError::validation(format!(
            "cwd is not a directory: {}",
            host.display()
        )));
    }
    Ok(host)
}

/// Allow-listed host environment merged under the request env, in sorted
/// key order.
fn restricted_env(extra: &HashMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in std::env::vars() {
        if ENV_ALLOW_LIST.contains(&key.as_str()) {
            out.insert(key, value);
        }
    }
    for (key, value) in extra {
        out.insert(key.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec_for(root: &Path) -> RuntimeSpec {
        RuntimeSpec {
            project_root: root.to_path_buf(),
            project_name: "test".into(),
            config: crate::config::Config::default(),
            base_raw_path: PathBuf::new(),
            instance_raw_path: PathBuf::new(),
        }
    }

    #[tokio::test]
    async fn test_probe_finds_bash() {
        let probe = OffBackend::new().probe().await;
        assert_eq!(probe.available, Path::new("/bin/bash").exists());
    }

    #[tokio::test]
    async fn test_exec_captures_streams_and_exit() {
        let dir = TempDir::new().unwrap();
        let backend = OffBackend::new();

        let result = backend
            .exec(
                &spec_for(dir.path()),
                ExecRequest {
                    command: "echo vibebox-off; echo oops >&2; exit 3".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, "vibebox-off\n");
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_exec_preserves_exit_255() {
        let dir = TempDir::new().unwrap();
        let result = OffBackend::new()
            .exec(
                &spec_for(dir.path()),
                ExecRequest {
                    command: "exit 255".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 255);
    }

    #[tokio::test]
    async fn test_env_allow_list_blocks_host_vars() {
        let dir = TempDir::new().unwrap();
        // A variable outside the allow-list must not leak into the child.
        std::env::set_var("VIBEBOX_TEST_SECRET", "leak");
        let result = OffBackend::new()
            .exec(
                &spec_for(dir.path()),
                ExecRequest {
                    command: "echo \"got:${VIBEBOX_TEST_SECRET:-none}\"".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        std::env::remove_var("VIBEBOX_TEST_SECRET");
        assert_eq!(result.stdout, "got:none\n");
    }

    #[tokio::test]
    async fn test_request_env_overrides() {
        let dir = TempDir::new().unwrap();
        let mut env = HashMap::new();
        env.insert("VIBEBOX_MARKER".to_string(), "present".to_string());
        let result = OffBackend::new()
            .exec(
                &spec_for(dir.path()),
                ExecRequest {
                    command: "echo $VIBEBOX_MARKER".into(),
                    env,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, "present\n");
    }

    #[test]
    fn test_resolve_host_cwd_jail() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        assert_eq!(resolve_host_cwd(dir.path(), "").unwrap(), dir.path());
        assert_eq!(resolve_host_cwd(dir.path(), "sub").unwrap(), sub);

        let err = resolve_host_cwd(dir.path(), "../outside").unwrap_err();
        assert!(matches!(err, VibeboxError::PathEscape { .. }));

        let err = resolve_host_cwd(dir.path(), "/etc").unwrap_err();
        assert!(matches!(err, VibeboxError::PathEscape { .. }));
    }

    #[tokio::test]
    async fn test_session_defaults_merge() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        let backend = OffBackend::new();
        let spec = spec_for(dir.path());

        let mut env = HashMap::new();
        env.insert("FROM_SESSION".to_string(), "yes".to_string());
        let handle = backend
            .start_session(
                &spec,
                SessionStartRequest {
                    session_id: "s_test".into(),
                    cwd: "nested".into(),
                    env,
                },
            )
            .await
            .unwrap();

        let result = backend
            .exec_in_session(
                &spec,
                &handle,
                ExecRequest {
                    command: "pwd; echo $FROM_SESSION".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(result.stdout.contains("nested"));
        assert!(result.stdout.contains("yes"));
    }
}
