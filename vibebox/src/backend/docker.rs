//! Docker backend: a thin wrapper over the daemon CLI.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backend::{
    run_interactive, Backend, ExecRequest, ExecResult, IoStreams, ProbeResult, RuntimeSpec,
};
use crate::config::MountMode;
use crate::errors::{VibeboxError, VibeboxResult};
use crate::util::{find_in_path, normalize_path};

const WORKSPACE_GUEST: &str = "/workspace";

pub struct DockerBackend;

impl DockerBackend {
    pub fn new() -> Self {
        DockerBackend
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn probe(&self) -> ProbeResult {
        if find_in_path("docker").is_none() {
            return ProbeResult::unavailable(
                "docker command not found",
                &[
                    "install Docker Desktop or docker engine",
                    "ensure docker is on PATH",
                ],
            );
        }

        let info = tokio::process::Command::new("docker")
            .arg("info")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match info {
            Ok(status) if status.success() => ProbeResult::available(),
            _ => ProbeResult::unavailable(
                "docker daemon not reachable",
                &["start docker daemon", "run `docker info` and fix errors"],
            ),
        }
    }

    async fn prepare(&self, spec: &RuntimeSpec) -> VibeboxResult<()> {
        let image = &spec.config.docker.image;
        let inspect = tokio::process::Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        if inspect.success() {
            return Ok(());
        }

        tracing::debug!(image, "pulling docker image");
        let pull = tokio::process::Command::new("docker")
            .args(["pull", image])
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await?;
        if !pull.success() {
            return Err(VibeboxError::validation(format!(
                "pull docker image {}: exited with {}",
                image, pull
            )));
        }
        Ok(())
    }

    async fn start(&self, spec: &RuntimeSpec, io: IoStreams) -> VibeboxResult<()> {
        let container_name = format!("vibebox-{}", sanitize_name(&spec.project_name));

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-it".into(),
            "--name".into(),
            container_name,
            "-e".into(),
            "IS_SANDBOX=1".into(),
        ];
        push_mount_args(&mut args, spec)?;
        args.push("-w".into());
        args.push(WORKSPACE_GUEST.into());
        args.push(spec.config.docker.image.clone());
        args.push("/bin/bash".into());

        let mut cmd = std::process::Command::new("docker");
        cmd.args(&args);
        let status = run_interactive(cmd, io).await?;
        if !status.success() {
            return Err(VibeboxError::validation(format!(
                "docker exited with code {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }

    async fn exec(&self, spec: &RuntimeSpec, req: ExecRequest) -> VibeboxResult<ExecResult> {
        let guest_cwd = resolve_guest_cwd(&spec.project_root, &req.cwd, WORKSPACE_GUEST)?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "-e".into(),
            "IS_SANDBOX=1".into(),
        ];
        push_mount_args(&mut args, spec)?;
        for (key, value) in sorted_env(&req.env) {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push("-w".into());
        args.push(guest_cwd);
        args.push(spec.config.docker.image.clone());
        args.push("/bin/bash".into());
        args.push("-lc".into());
        args.push(req.command.clone());

        let output = tokio::process::Command::new("docker")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Append `-v host:guest:mode` for each configured mount. Relative host
/// paths are resolved against the project root and must exist.
fn push_mount_args(args: &mut Vec<String>, spec: &RuntimeSpec) -> VibeboxResult<()> {
    for mount in &spec.config.mounts {
        let host = if Path::new(&mount.host).is_absolute() {
            PathBuf::from(&mount.host)
        } else {
            spec.project_root.join(&mount.host)
        };
        let host = normalize_path(&host);
        if !host.exists() {
            return Err(VibeboxError::validation(format!(
                "mount host path does not exist: {}",
                host.display()
            )));
        }
        args.push("-v".into());
        args.push(format!(
            "{}:{}:{}",
            host.display(),
            mount.guest,
            mount.mode.as_str()
        ));
    }
    Ok(())
}

/// Resolve the guest working directory, jailing relative paths under the
/// workspace mount.
fn resolve_guest_cwd(
    project_root: &Path,
    requested: &str,
    workspace_guest: &str,
) -> VibeboxResult<String> {
    if requested.is_empty() {
        return Ok(workspace_guest.to_string());
    }
    if requested.starts_with('/') {
        return Ok(requested.to_string());
    }

    let host_path = normalize_path(&project_root.join(requested));
    let root = normalize_path(project_root);
    let rel = host_path
        .strip_prefix(&root)
        .map_err(|_| VibeboxError::PathEscape {
            path: host_path.display().to_string(),
            root: root.display().to_string(),
        })?;
    Ok(normalize_path(&Path::new(workspace_guest).join(rel))
        .display()
        .to_string())
}

fn sorted_env(env: &HashMap<String, String>) -> BTreeMap<&String, &String> {
    env.iter().collect()
}

/// Container names only allow `[a-z0-9_-]`; everything else is dropped
/// after lowercasing, spaces become dashes, empties become "project".
fn sanitize_name(input: &str) -> String {
    let lowered = input.to_lowercase().replace(' ', "-");
    let out: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_')
        .collect();
    if out.is_empty() {
        "project".to_string()
    } else {
        out
    }
}
