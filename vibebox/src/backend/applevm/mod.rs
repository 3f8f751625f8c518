//! Apple Silicon VM backend over the platform Virtualization framework.
//!
//! Each command runs in its own VM lifecycle: boot the instance disk,
//! reach a shell prompt over the serial console, mount the virtiofs
//! shares, run one framed command, and power off. There is no SSH, no
//! agent, no guest daemon: the serial console is the only channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{
    merge_env, Backend, ExecRequest, ExecResult, IoStreams, ProbeResult, RuntimeSpec,
    SessionBackend, SessionHandle, SessionStartRequest,
};
use crate::config::MountMode;
use crate::errors::{VibeboxError, VibeboxResult};
use crate::util::normalize_path;

pub(crate) mod console;
pub(crate) mod framing;
pub(crate) mod lock;
pub(crate) mod shell;
#[cfg(target_os = "macos")]
mod vm;

pub(crate) const WORKSPACE_GUEST_PATH: &str = "/workspace";

pub(crate) const BOOT_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const LOGIN_TIMEOUT: Duration = Duration::from_secs(180);
pub(crate) const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PROVISION_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Closed set of shell prompt substrings the boot state machine accepts.
/// Guest images must be vetted against this list; it is the single place
/// the prompts are configured.
pub(crate) const SHELL_PROMPT_HINTS: &[&str] = &["~# ", ":~# ", ":/# ", "/workspace# ", "# "];

#[cfg(target_os = "macos")]
const VIRTUALIZATION_ENTITLEMENT: &str = "com.apple.security.virtualization";

/// Guest-path binding of one virtiofs share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShareBinding {
    pub share_name: String,
    pub guest_path: String,
    pub mode: MountMode,
}

/// Host side of one virtiofs share, consumed by the VM configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostShare {
    pub name: String,
    pub host_path: PathBuf,
    pub read_only: bool,
}

pub struct AppleVmBackend;

struct VmSessionHandle {
    default_cwd: String,
    default_env: HashMap<String, String>,
}

impl AppleVmBackend {
    pub fn new() -> Self {
        AppleVmBackend
    }

    /// Run the provision script once against the freshly copied instance
    /// disk. A non-zero exit fails the prepare; the caller deletes the
    /// instance disk so the next run retries.
    async fn provision_instance(&self, spec: &RuntimeSpec) -> VibeboxResult<()> {
        let Some(script_path) = spec
            .config
            .vm
            .provision_script
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return Ok(());
        };

        let script_path = if Path::new(script_path).is_absolute() {
            PathBuf::from(script_path)
        } else {
            spec.project_root.join(script_path)
        };
        let script = std::fs::read_to_string(&script_path).map_err(|e| {
            VibeboxError::validation(format!(
                "read provision script {}: {}",
                script_path.display(),
                e
            ))
        })?;

        let command = shell::build_provision_command(&script);
        tracing::info!(script = %script_path.display(), "provisioning instance disk");
        let result = self
            .exec(
                spec,
                ExecRequest {
                    command,
                    cwd: workspace_guest_from_spec(spec),
                    env: HashMap::new(),
                    timeout: PROVISION_TIMEOUT,
                },
            )
            .await?;
        if result.exit_code != 0 {
            return Err(VibeboxError::validation(format!(
                "provision script exited with code {} (stdout tail={:?}, stderr tail={:?})",
                result.exit_code,
                framing::output_tail(&result.stdout, 512),
                framing::output_tail(&result.stderr, 512),
            )));
        }
        Ok(())
    }
}

impl Default for AppleVmBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for AppleVmBackend {
    fn name(&self) -> &'static str {
        "apple-vm"
    }

    #[cfg(not(target_os = "macos"))]
    async fn probe(&self) -> ProbeResult {
        ProbeResult::unavailable(
            "apple-vm backend is only available on darwin",
            &["use provider=docker or provider=off on non-darwin hosts"],
        )
    }

    #[cfg(target_os = "macos")]
    async fn probe(&self) -> ProbeResult {
        if let Err(reason) = vm::probe_framework() {
            return ProbeResult::unavailable(
                reason,
                &["verify macOS virtualization support", "or use provider=docker/off"],
            );
        }

        if crate::util::find_in_path("codesign").is_none() {
            return ProbeResult::unavailable(
                "codesign command not found",
                &["install Xcode command line tools"],
            );
        }

        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                return ProbeResult::unavailable(
                    format!("failed to resolve executable path: {}", e),
                    &["run vibebox from a regular executable path"],
                );
            }
        };
        match has_virtualization_entitlement(&exe).await {
            Ok(true) => ProbeResult::available(),
            Ok(false) => ProbeResult::unavailable(
                "vibebox binary is missing virtualization entitlement",
                &[
                    "sign the vibebox binary with com.apple.security.virtualization entitlement",
                    "or use provider=docker/off",
                ],
            ),
            Err(e) => ProbeResult::unavailable(
                format!("failed to inspect executable entitlements: {}", e),
                &[
                    "run `codesign -d --entitlements - --xml <vibebox-binary>` manually",
                    "or use provider=docker/off",
                ],
            ),
        }
    }

    async fn prepare(&self, spec: &RuntimeSpec) -> VibeboxResult<()> {
        if !spec.base_raw_path.exists() {
            return Err(VibeboxError::validation(format!(
                "base raw image missing: {}",
                spec.base_raw_path.display()
            )));
        }
        // An existing instance disk preserves provisioning across runs.
        if spec.instance_raw_path.exists() {
            return Ok(());
        }
        if let Some(parent) = spec.instance_raw_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        {
            // Exactly one process may build the instance disk. Released
            // before provisioning, which boots a VM and relocks it.
            let _disk_lock = lock::InstanceLock::acquire(&spec.instance_raw_path)?;
            copy_disk(&spec.base_raw_path, &spec.instance_raw_path).await?;
        }

        if let Err(e) = self.provision_instance(spec).await {
            let _ = std::fs::remove_file(&spec.instance_raw_path);
            return Err(VibeboxError::validation(format!(
                "provision instance disk: {}",
                e
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    async fn start(&self, _spec: &RuntimeSpec, _io: IoStreams) -> VibeboxResult<()> {
        Err(darwin_only())
    }

    #[cfg(target_os = "macos")]
    async fn start(&self, spec: &RuntimeSpec, io: IoStreams) -> VibeboxResult<()> {
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || vm::run_interactive(&spec, io))
            .await
            .map_err(|e| VibeboxError::Internal(format!("vm task failed: {e}")))?
    }

    #[cfg(not(target_os = "macos"))]
    async fn exec(&self, _spec: &RuntimeSpec, _req: ExecRequest) -> VibeboxResult<ExecResult> {
        Err(darwin_only())
    }

    #[cfg(target_os = "macos")]
    async fn exec(&self, spec: &RuntimeSpec, req: ExecRequest) -> VibeboxResult<ExecResult> {
        let guest_cwd = resolve_exec_cwd(spec, &req.cwd)?;
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || vm::run_exec(&spec, &guest_cwd, req))
            .await
            .map_err(|e| VibeboxError::Internal(format!("vm task failed: {e}")))?
    }

    fn as_session_backend(&self) -> Option<&dyn SessionBackend> {
        Some(self)
    }
}

#[async_trait]
impl SessionBackend for AppleVmBackend {
    async fn start_session(
        &self,
        spec: &RuntimeSpec,
        req: SessionStartRequest,
    ) -> VibeboxResult<SessionHandle> {
        let default_cwd = resolve_exec_cwd(spec, &req.cwd)?;
        Ok(std::sync::Arc::new(VmSessionHandle {
            default_cwd,
            default_env: req.env,
        }))
    }

    async fn exec_in_session(
        &self,
        spec: &RuntimeSpec,
        handle: &SessionHandle,
        req: ExecRequest,
    ) -> VibeboxResult<ExecResult> {
        let handle = handle
            .downcast_ref::<VmSessionHandle>()
            .ok_or_else(|| VibeboxError::Internal("invalid apple-vm session handle".into()))?;

        let cwd = if req.cwd.is_empty() {
            handle.default_cwd.clone()
        } else {
            req.cwd
        };
        self.exec(
            spec,
            ExecRequest {
                command: req.command,
                cwd,
                env: merge_env(&handle.default_env, &req.env),
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
        // Transitional mode: each exec runs in an isolated VM lifecycle,
        // so there is nothing persistent to tear down.
        Ok(())
    }
}

#[cfg(not(target_os = "macos"))]
fn darwin_only() -> VibeboxError {
    VibeboxError::Unavailable {
        name: "apple-vm".into(),
        reason: "apple-vm backend is only available on darwin".into(),
        hints: vec!["use provider=docker or provider=off on non-darwin hosts".into()],
    }
}

/// Resolve the guest cwd for an exec request. A relative cwd requires the
/// project root to be mounted somewhere in the guest.
pub(crate) fn resolve_exec_cwd(spec: &RuntimeSpec, requested: &str) -> VibeboxResult<String> {
    let mut workspace_guest = workspace_guest_from_spec(spec);
    if !requested.is_empty() && !requested.starts_with('/') {
        workspace_guest = project_root_guest_from_spec(spec).ok_or_else(|| {
            VibeboxError::validation(format!(
                "relative cwd requires a mount for project root {}",
                spec.project_root.display()
            ))
        })?;
    }
    resolve_vm_guest_cwd(&spec.project_root, requested, &workspace_guest)
}

/// Map a requested cwd onto the guest filesystem: absolute passes through,
/// empty falls back to the workspace, relative is jailed under the
/// project-root mount.
pub(crate) fn resolve_vm_guest_cwd(
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

/// The guest path of a mount whose host side is the project root itself.
pub(crate) fn project_root_guest_from_spec(spec: &RuntimeSpec) -> Option<String> {
    let root = normalize_path(&spec.project_root);
    for mount in &spec.config.mounts {
        if mount.guest.is_empty() || mount.host.is_empty() {
            continue;
        }
        let host = if Path::new(&mount.host).is_absolute() {
            PathBuf::from(&mount.host)
        } else {
            spec.project_root.join(&mount.host)
        };
        if normalize_path(&host) == root {
            return Some(mount.guest.clone());
        }
    }
    None
}

/// Default guest working directory: the project-root mount if present,
/// else the first declared mount, else `/workspace`.
pub(crate) fn workspace_guest_from_spec(spec: &RuntimeSpec) -> String {
    if let Some(guest) = project_root_guest_from_spec(spec) {
        return guest;
    }
    for mount in &spec.config.mounts {
        if !mount.guest.is_empty() {
            return mount.guest.clone();
        }
    }
    WORKSPACE_GUEST_PATH.to_string()
}

/// Resolve the configured mounts into virtiofs shares. A config with no
/// mounts defaults to the project root shared read-write at the workspace
/// path. Mount `i` becomes the named share `share<i>`.
pub(crate) fn build_shares(
    spec: &RuntimeSpec,
) -> VibeboxResult<(Vec<HostShare>, Vec<ShareBinding>)> {
    let mounts = &spec.config.mounts;
    if mounts.is_empty() {
        return Ok((
            vec![HostShare {
                name: "share0".into(),
                host_path: spec.project_root.clone(),
                read_only: false,
            }],
            vec![ShareBinding {
                share_name: "share0".into(),
                guest_path: workspace_guest_from_spec(spec),
                mode: MountMode::Rw,
            }],
        ));
    }

    let mut shares = Vec::with_capacity(mounts.len());
    let mut bindings = Vec::with_capacity(mounts.len());
    for (i, mount) in mounts.iter().enumerate() {
        let host = if mount.host.is_empty() {
            spec.project_root.clone()
        } else if Path::new(&mount.host).is_absolute() {
            PathBuf::from(&mount.host)
        } else {
            spec.project_root.join(&mount.host)
        };
        let host = normalize_path(&host);
        let guest = if mount.guest.is_empty() {
            WORKSPACE_GUEST_PATH.to_string()
        } else {
            mount.guest.clone()
        };
        if !guest.starts_with('/') {
            return Err(VibeboxError::validation(format!(
                "mount guest path must be absolute: {}",
                guest
            )));
        }
        let meta = std::fs::metadata(&host).map_err(|_| {
            VibeboxError::validation(format!(
                "mount host path does not exist: {}",
                host.display()
            ))
        })?;
        if !meta.is_dir() {
            return Err(VibeboxError::validation(format!(
                "mount host path is not a directory: {}",
                host.display()
            )));
        }

        let name = format!("share{}", i);
        shares.push(HostShare {
            name: name.clone(),
            host_path: host,
            read_only: mount.mode == MountMode::Ro,
        });
        bindings.push(ShareBinding {
            share_name: name,
            guest_path: guest,
            mode: mount.mode,
        });
    }
    Ok((shares, bindings))
}

/// Plain bytewise copy of the base raw into the instance disk, fsynced at
/// the end.
async fn copy_disk(base: &Path, instance: &Path) -> VibeboxResult<()> {
    let base = base.to_path_buf();
    let instance = instance.to_path_buf();
    tokio::task::spawn_blocking(move || -> VibeboxResult<()> {
        let mut src = std::fs::File::open(&base)?;
        let mut dst = std::fs::File::create(&instance)?;
        std::io::copy(&mut src, &mut dst)?;
        dst.sync_all()?;
        Ok(())
    })
    .await
    .map_err(|e| VibeboxError::Internal(format!("disk copy task failed: {e}")))?
}

/// Inspect the signed binary's entitlement blob for the virtualization
/// identifier. codesign writes the XML to stdout or stderr depending on
/// version, so both are searched.
#[cfg(target_os = "macos")]
async fn has_virtualization_entitlement(executable: &Path) -> VibeboxResult<bool> {
    let output = tokio::process::Command::new("codesign")
        .args(["-d", "--entitlements", "-", "--xml"])
        .arg(executable)
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        let mut msg = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if msg.is_empty() {
            msg = format!("codesign exited with {}", output.status);
        }
        return Err(VibeboxError::validation(format!(
            "codesign inspect failed: {}",
            msg
        )));
    }
    let payload = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(payload.contains(VIRTUALIZATION_ENTITLEMENT))
}
