//! Application-layer service façade.
//!
//! Composes the catalog, artifact store, selector and backends behind the
//! embedding API: `initialize / probe / start / exec` plus the session
//! registry (`start_session / exec_in_session / stop_session /
//! get_session`).
//!
//! **Locking**: the session registry sits behind one `RwLock`. Public
//! methods hold the write lock only around create/remove and the state
//! flip; all blocking work (probe, prepare, exec) runs with the lock
//! released, so sessions proceed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;

use crate::backend::{
    self, applevm::AppleVmBackend, docker::DockerBackend, off::OffBackend, Backend, ProbeResult,
    RuntimeSpec, SessionHandle,
};
use crate::config::{self, Config, Provider};
use crate::errors::{VibeboxError, VibeboxResult};
use crate::images::{catalog, ImageManager};
use crate::progress::{FnSink, NopSink, ProgressSink};

mod types;

pub use types::*;

/// The public application-layer entrypoint for embedding vibebox.
pub struct Service {
    sessions: RwLock<HashMap<String, ManagedSession>>,
}

struct ManagedSession {
    session: Session,
    backend: Arc<dyn Backend>,
    /// Present when the backend exposes the session capability.
    handle: Option<SessionHandle>,
    spec: RuntimeSpec,
    default_cwd: String,
    default_env: HashMap<String, String>,
}

impl Service {
    pub fn new() -> Self {
        Service {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Official white-listed images for the given architecture (empty =
    /// host architecture).
    pub fn list_images(&self, arch: &str) -> Vec<Image> {
        catalog::list_for_arch(arch)
            .iter()
            .map(Image::from)
            .collect()
    }

    /// First official image for the given architecture.
    pub fn resolve_default_image(&self, arch: &str) -> VibeboxResult<Image> {
        let arch_label = if arch.is_empty() {
            config::host_arch()
        } else {
            arch
        };
        self.list_images(arch)
            .into_iter()
            .next()
            .ok_or_else(|| {
                VibeboxError::validation(format!(
                    "no official images available for arch={}",
                    arch_label
                ))
            })
    }

    /// Prepare image artifacts and write the project config.
    pub async fn initialize(&self, req: InitializeRequest) -> VibeboxResult<InitializeResult> {
        let project_root = resolve_project_root(req.project_root.as_deref())?;

        let desc = match &req.image_id {
            Some(id) if !id.is_empty() => catalog::find_by_id(id)
                .ok_or_else(|| crate::errors::ImageError::UnknownImage(id.clone()))?,
            _ => {
                let images = catalog::list_for_arch("");
                images.into_iter().next().ok_or_else(|| {
                    VibeboxError::validation(format!(
                        "no official images available for arch={}",
                        config::host_arch()
                    ))
                })?
            }
        };
        if desc.arch != config::host_arch() {
            return Err(crate::errors::ImageError::ArchMismatch {
                id: desc.id.to_string(),
                image_arch: desc.arch.to_string(),
                host_arch: config::host_arch().to_string(),
            }
            .into());
        }

        let provider = normalize_provider(req.provider)?;

        let manager = ImageManager::new()?;
        let sink = progress_sink(&req.on_event);
        let prepared = manager.ensure_prepared(&desc, sink.as_ref()).await?;

        let mut cfg = Config::default();
        cfg.provider = provider;
        cfg.vm.image_id = desc.id.to_string();
        cfg.vm.image_version = desc.version.to_string();
        if let Some(cpus) = req.cpus {
            cfg.vm.cpus = cpus;
        }
        if let Some(ram_mb) = req.ram_mb {
            cfg.vm.ram_mb = ram_mb;
        }
        if let Some(disk_gb) = req.disk_gb {
            cfg.vm.disk_gb = disk_gb;
        }
        cfg.vm.provision_script = req.provision_script.clone();
        if req.no_default_mounts {
            cfg.mounts.clear();
        }
        cfg.mounts.extend(req.mounts.iter().cloned());

        let config_path = config::project_config_path(&project_root);
        config::save(&config_path, &mut cfg)?;

        emit(
            &req.on_event,
            ServiceEvent {
                done: true,
                ..ServiceEvent::simple("init.completed", "initialization completed")
            },
        );
        Ok(InitializeResult {
            project_root,
            config_path,
            image: Image::from(&desc),
            base_raw_path: prepared.raw_path,
        })
    }

    /// Evaluate backend availability and provider selection. The report's
    /// diagnostics are populated even when selection fails.
    pub async fn probe(&self, provider: Option<Provider>) -> ProbeReport {
        let provider = match normalize_provider(provider) {
            Ok(p) => p,
            Err(e) => {
                return ProbeReport {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let (off, apple_vm, docker) = backends();
        match backend::select(provider, off, apple_vm, docker).await {
            Ok(selection) => ProbeReport {
                selected: Some(selection.provider),
                was_fallback: selection.was_fallback,
                fallback_from: selection.fallback_from,
                diagnostics: to_diagnostics(&selection.diagnostics),
                error: None,
            },
            Err(e) => {
                // Re-probe for the diagnostics map: the selection error
                // itself does not carry it.
                let (off, apple_vm, docker) = backends();
                let (off_probe, apple_probe, docker_probe) =
                    tokio::join!(off.probe(), apple_vm.probe(), docker.probe());
                let mut diagnostics = HashMap::new();
                diagnostics.insert("off".to_string(), from_probe(&off_probe));
                diagnostics.insert("apple-vm".to_string(), from_probe(&apple_probe));
                diagnostics.insert("docker".to_string(), from_probe(&docker_probe));
                ProbeReport {
                    selected: None,
                    was_fallback: false,
                    fallback_from: String::new(),
                    diagnostics,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Launch an interactive sandbox session; returns when it ends.
    pub async fn start(&self, req: StartRequest) -> VibeboxResult<StartOutcome> {
        let (project_root, cfg, base_raw) =
            self.resolve_project_runtime(req.project_root.as_deref(), req.provider_override, true)?;

        let provider = effective_provider(&cfg, req.provider_override)?;
        let (off, apple_vm, docker) = backends();
        let selection = backend::select(provider, off, apple_vm, docker).await?;

        let outcome = StartOutcome {
            selected: selection.provider,
            was_fallback: selection.was_fallback,
            fallback_from: selection.fallback_from.clone(),
            diagnostics: to_diagnostics(&selection.diagnostics),
        };
        if selection.was_fallback {
            emit(
                &req.on_event,
                ServiceEvent::simple(
                    "start.fallback",
                    format!(
                        "fallback from {} to {}",
                        selection.fallback_from,
                        selection.backend.name()
                    ),
                ),
            );
        }

        let spec = runtime_spec(&project_root, cfg, base_raw);

        emit(&req.on_event, ServiceEvent::simple("start.prepare", "preparing backend"));
        selection.backend.prepare(&spec).await?;

        emit(
            &req.on_event,
            ServiceEvent::simple(
                "start.running",
                format!("starting {} backend", selection.backend.name()),
            ),
        );
        selection.backend.start(&spec, req.io).await?;

        emit(
            &req.on_event,
            ServiceEvent {
                done: true,
                ..ServiceEvent::simple("start.completed", "sandbox session ended")
            },
        );
        Ok(outcome)
    }

    /// Execute one command non-interactively with deterministic output.
    pub async fn exec(&self, req: ExecRequest) -> VibeboxResult<ExecOutcome> {
        if req.command.is_empty() {
            return Err(VibeboxError::validation("command is required"));
        }

        let (project_root, cfg, base_raw) = self.resolve_project_runtime(
            req.project_root.as_deref(),
            req.provider_override,
            false,
        )?;

        let provider = effective_provider(&cfg, req.provider_override)?;
        let (off, apple_vm, docker) = backends();
        let selection = backend::select(provider, off, apple_vm, docker).await?;
        let diagnostics = to_diagnostics(&selection.diagnostics);

        let spec = runtime_spec(&project_root, cfg, base_raw);

        emit(&req.on_event, ServiceEvent::simple("exec.prepare", "preparing backend"));
        selection.backend.prepare(&spec).await?;

        emit(
            &req.on_event,
            ServiceEvent::simple(
                "exec.running",
                format!("executing via {}", selection.backend.name()),
            ),
        );
        let timeout = Duration::from_secs(req.timeout_seconds);
        let backend_req = backend::ExecRequest {
            command: req.command.clone(),
            cwd: req.cwd.clone(),
            env: req.env.clone(),
            timeout,
        };
        let result = exec_with_timeout(selection.backend.as_ref(), &spec, backend_req).await?;

        emit(
            &req.on_event,
            ServiceEvent {
                done: true,
                ..ServiceEvent::simple("exec.completed", "command execution completed")
            },
        );
        Ok(ExecOutcome {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            selected: selection.provider,
            diagnostics,
        })
    }

    /// Create a reusable sandbox session for repeated command execution.
    pub async fn start_session(&self, req: StartSessionRequest) -> VibeboxResult<Session> {
        let (project_root, cfg, base_raw) = self.resolve_project_runtime(
            req.project_root.as_deref(),
            req.provider_override,
            false,
        )?;

        let provider = effective_provider(&cfg, req.provider_override)?;
        let (off, apple_vm, docker) = backends();
        let selection = backend::select(provider, off, apple_vm, docker).await?;
        let spec = runtime_spec(&project_root, cfg, base_raw);

        emit(
            &req.on_event,
            ServiceEvent::simple("session.start.prepare", "preparing backend"),
        );
        selection.backend.prepare(&spec).await?;

        let session_id = new_session_id();

        let handle = match selection.backend.as_session_backend() {
            Some(session_backend) => {
                emit(
                    &req.on_event,
                    ServiceEvent::simple(
                        "session.start.backend",
                        format!("starting session on {}", selection.backend.name()),
                    ),
                );
                Some(
                    session_backend
                        .start_session(
                            &spec,
                            backend::SessionStartRequest {
                                session_id: session_id.clone(),
                                cwd: req.cwd.clone(),
                                env: req.env.clone(),
                            },
                        )
                        .await?,
                )
            }
            None => None,
        };

        let session = Session {
            id: session_id.clone(),
            selected: selection.provider,
            diagnostics: to_diagnostics(&selection.diagnostics),
            created_at: Utc::now(),
            state: SessionState::Active,
        };

        {
            let mut sessions = self.acquire_write()?;
            sessions.insert(
                session_id,
                ManagedSession {
                    session: session.clone(),
                    backend: selection.backend,
                    handle,
                    spec,
                    default_cwd: req.cwd,
                    default_env: req.env,
                },
            );
        }

        emit(
            &req.on_event,
            ServiceEvent {
                done: true,
                ..ServiceEvent::simple("session.start.completed", "session started")
            },
        );
        Ok(session)
    }

    /// Execute a command in a previously created session.
    pub async fn exec_in_session(&self, req: ExecInSessionRequest) -> VibeboxResult<ExecOutcome> {
        if req.command.is_empty() {
            return Err(VibeboxError::validation("command is required"));
        }

        // Copy what the exec needs out of the registry so the lock is not
        // held across backend work.
        let (backend_arc, handle, spec, default_cwd, default_env, selected, diagnostics) = {
            let sessions = self.acquire_read()?;
            let record = sessions
                .get(&req.session_id)
                .ok_or_else(|| VibeboxError::SessionNotFound(req.session_id.clone()))?;
            if record.session.state != SessionState::Active {
                return Err(VibeboxError::SessionNotActive(req.session_id.clone()));
            }
            (
                Arc::clone(&record.backend),
                record.handle.clone(),
                record.spec.clone(),
                record.default_cwd.clone(),
                record.default_env.clone(),
                record.session.selected,
                record.session.diagnostics.clone(),
            )
        };

        emit(
            &req.on_event,
            ServiceEvent::simple(
                "session.exec.running",
                format!("executing via {}", backend_arc.name()),
            ),
        );

        let timeout = Duration::from_secs(req.timeout_seconds);
        let result = match (backend_arc.as_session_backend(), &handle) {
            (Some(session_backend), Some(handle)) => {
                let backend_req = backend::ExecRequest {
                    command: req.command.clone(),
                    cwd: req.cwd.clone(),
                    env: req.env.clone(),
                    timeout,
                };
                with_timeout(
                    timeout,
                    session_backend.exec_in_session(&spec, handle, backend_req),
                )
                .await?
            }
            _ => {
                // No backend session capability: merge the session defaults
                // here in the façade.
                let cwd = if req.cwd.is_empty() {
                    default_cwd
                } else {
                    req.cwd.clone()
                };
                let backend_req = backend::ExecRequest {
                    command: req.command.clone(),
                    cwd,
                    env: backend::merge_env(&default_env, &req.env),
                    timeout,
                };
                exec_with_timeout(backend_arc.as_ref(), &spec, backend_req).await?
            }
        };

        emit(
            &req.on_event,
            ServiceEvent {
                done: true,
                ..ServiceEvent::simple("session.exec.completed", "command execution completed")
            },
        );
        Ok(ExecOutcome {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            selected,
            diagnostics,
        })
    }

    /// Stop a managed session. Stopping an already stopped session is a
    /// no-op.
    pub async fn stop_session(&self, req: StopSessionRequest) -> VibeboxResult<()> {
        let (backend_arc, handle, spec) = {
            let mut sessions = self.acquire_write()?;
            let record = sessions
                .get_mut(&req.session_id)
                .ok_or_else(|| VibeboxError::SessionNotFound(req.session_id.clone()))?;
            if record.session.state == SessionState::Stopped {
                return Ok(());
            }
            record.session.state = SessionState::Stopped;
            (
                Arc::clone(&record.backend),
                record.handle.clone(),
                record.spec.clone(),
            )
        };

        if let (Some(session_backend), Some(handle)) = (backend_arc.as_session_backend(), &handle) {
            emit(
                &req.on_event,
                ServiceEvent::simple(
                    "session.stop.backend",
                    format!("stopping {} session", backend_arc.name()),
                ),
            );
            session_backend.stop_session(&spec, handle).await?;
        }

        emit(
            &req.on_event,
            ServiceEvent {
                done: true,
                ..ServiceEvent::simple("session.stop.completed", "session stopped")
            },
        );
        Ok(())
    }

    /// Session metadata by id.
    pub fn get_session(&self, session_id: &str) -> VibeboxResult<Session> {
        let sessions = self.acquire_read()?;
        sessions
            .get(session_id)
            .map(|record| record.session.clone())
            .ok_or_else(|| VibeboxError::SessionNotFound(session_id.to_string()))
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

impl Service {
    fn acquire_read(
        &self,
    ) -> VibeboxResult<RwLockReadGuard<'_, HashMap<String, ManagedSession>>> {
        self.sessions
            .read()
            .map_err(|e| VibeboxError::Internal(format!("session registry lock poisoned: {e}")))
    }

    fn acquire_write(
        &self,
    ) -> VibeboxResult<RwLockWriteGuard<'_, HashMap<String, ManagedSession>>> {
        self.sessions
            .write()
            .map_err(|e| VibeboxError::Internal(format!("session registry lock poisoned: {e}")))
    }

    /// Resolve project root, config (or defaults), and the base raw path
    /// recorded in the image lock.
    fn resolve_project_runtime(
        &self,
        project_root: Option<&Path>,
        provider_override: Option<Provider>,
        require_initialized: bool,
    ) -> VibeboxResult<(PathBuf, Config, PathBuf)> {
        let project_root = resolve_project_root(project_root)?;

        let config_path = config::project_config_path(&project_root);
        let cfg = match config::load(&config_path) {
            Ok(cfg) => cfg,
            Err(VibeboxError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if require_initialized {
                    return Err(VibeboxError::Config(
                        "project is not initialized. run `vibebox init`".into(),
                    ));
                }
                let mut cfg = Config::default();
                if provider_override == Some(Provider::Off) {
                    cfg.provider = Provider::Off;
                }
                cfg
            }
            Err(e) => return Err(e),
        };

        let lock = config::load_image_lock(&config::user_lock_path()?)?;
        let base_raw = if !cfg.vm.image_id.is_empty() && !cfg.vm.image_version.is_empty() {
            lock.images
                .get(&config::lock_key(&cfg.vm.image_id, &cfg.vm.image_version))
                .map(|entry| entry.raw_path.clone())
                .unwrap_or_default()
        } else {
            PathBuf::new()
        };

        Ok((project_root, cfg, base_raw))
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

fn backends() -> (Arc<dyn Backend>, Arc<dyn Backend>, Arc<dyn Backend>) {
    (
        Arc::new(OffBackend::new()),
        Arc::new(AppleVmBackend::new()),
        Arc::new(DockerBackend::new()),
    )
}

fn runtime_spec(project_root: &Path, cfg: Config, base_raw: PathBuf) -> RuntimeSpec {
    RuntimeSpec {
        project_root: project_root.to_path_buf(),
        project_name: project_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string()),
        config: cfg,
        base_raw_path: base_raw,
        instance_raw_path: config::instance_disk_path(project_root),
    }
}

fn resolve_project_root(root: Option<&Path>) -> VibeboxResult<PathBuf> {
    match root {
        None => Ok(std::env::current_dir()?),
        Some(root) if root.is_absolute() => Ok(root.to_path_buf()),
        Some(root) => Ok(std::env::current_dir()?.join(root)),
    }
}

/// Empty provider means auto; the legacy `macos` alias normalizes to
/// `apple-vm` on the way in.
fn normalize_provider(provider: Option<Provider>) -> VibeboxResult<Provider> {
    let provider = provider.unwrap_or(Provider::Auto).normalize();
    provider.validate()?;
    Ok(provider)
}

fn effective_provider(
    cfg: &Config,
    provider_override: Option<Provider>,
) -> VibeboxResult<Provider> {
    match provider_override {
        Some(p) => normalize_provider(Some(p)),
        None => Ok(cfg.provider.normalize()),
    }
}

async fn exec_with_timeout(
    backend: &dyn Backend,
    spec: &RuntimeSpec,
    req: backend::ExecRequest,
) -> VibeboxResult<backend::ExecResult> {
    let timeout = req.timeout;
    with_timeout(timeout, backend.exec(spec, req)).await
}

/// Wrap the command phase only; zero means no service-level deadline (the
/// apple-vm backend still applies its own 10-minute default internally).
async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = VibeboxResult<T>>,
) -> VibeboxResult<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(VibeboxError::Timeout(timeout)),
    }
}

fn progress_sink(on_event: &Option<EventHandler>) -> Box<dyn ProgressSink> {
    match on_event {
        None => Box::new(NopSink),
        Some(handler) => {
            let handler = Arc::clone(handler);
            Box::new(FnSink(move |event: crate::progress::ProgressEvent| {
                handler(ServiceEvent {
                    kind: "init.progress".into(),
                    phase: event.phase.as_str().into(),
                    message: event.message,
                    percent: event.percent,
                    bytes_done: event.bytes_done,
                    bytes_total: event.bytes_total,
                    speed_bps: event.speed_bps,
                    eta: event.eta,
                    error: event.error,
                    done: event.done,
                })
            }))
        }
    }
}

fn from_probe(probe: &ProbeResult) -> BackendDiagnostic {
    BackendDiagnostic {
        available: probe.available,
        reason: probe.reason.clone(),
        fix_hints: probe.fix_hints.clone(),
    }
}

fn to_diagnostics(probes: &HashMap<String, ProbeResult>) -> HashMap<String, BackendDiagnostic> {
    probes
        .iter()
        .map(|(name, probe)| (name.clone(), from_probe(probe)))
        .collect()
}

fn emit(handler: &Option<EventHandler>, event: ServiceEvent) {
    if let Some(handler) = handler {
        handler(event);
    }
}

/// Opaque session id: `s_` + 16 hex chars from the OS RNG.
fn new_session_id() -> String {
    let mut buf = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    let hex: String = buf.iter().map(|b| format!("{:02x}", b)).collect();
    format!("s_{}", hex)
}

// Compile-time assertion: the service must be shareable across threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Service>;
};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert!(id.starts_with("s_"));
        assert_eq!(id.len(), 18);
        assert!(id[2..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn test_normalize_provider() {
        assert_eq!(normalize_provider(None).unwrap(), Provider::Auto);
        assert_eq!(
            normalize_provider(Some(Provider::Macos)).unwrap(),
            Provider::AppleVm
        );
        assert_eq!(
            normalize_provider(Some(Provider::Off)).unwrap(),
            Provider::Off
        );
    }

    #[test]
    fn test_resolve_default_image() {
        let svc = Service::new();
        // The catalog covers arm64 and amd64; other hosts have no image.
        match svc.resolve_default_image("") {
            Ok(image) => assert_eq!(image.arch, config::host_arch()),
            Err(e) => assert!(e.to_string().contains("no official images")),
        }
        let arm = svc.resolve_default_image("arm64").unwrap();
        assert_eq!(arm.id, "debian-13-nocloud-arm64");
    }

    #[tokio::test]
    async fn test_exec_off_without_init() {
        let svc = Service::new();
        let project = TempDir::new().unwrap();

        let result = svc
            .exec(ExecRequest {
                project_root: Some(project.path().to_path_buf()),
                provider_override: Some(Provider::Off),
                command: "echo vibebox-off".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "vibebox-off\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.selected, Provider::Off);
        assert!(result.diagnostics.contains_key("off"));
    }

    #[tokio::test]
    async fn test_exec_requires_command() {
        let svc = Service::new();
        let err = svc.exec(ExecRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("command is required"));
    }

    #[tokio::test]
    async fn test_probe_off() {
        let svc = Service::new();
        let report = svc.probe(Some(Provider::Off)).await;
        assert!(report.ok());
        assert_eq!(report.selected, Some(Provider::Off));
        assert!(report.diagnostics["off"].available);
        assert_eq!(report.diagnostics.len(), 3);
    }

    #[tokio::test]
    async fn test_probe_invalid_keeps_diagnostics_shape() {
        let svc = Service::new();
        // apple-vm off darwin: explicitly requesting it fails but the
        // report still carries all three diagnostics.
        if cfg!(not(target_os = "macos")) {
            let report = svc.probe(Some(Provider::AppleVm)).await;
            assert!(!report.ok());
            assert!(report.selected.is_none());
            assert_eq!(report.diagnostics.len(), 3);
            assert!(!report.diagnostics["apple-vm"].available);
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle_on_off() {
        let svc = Service::new();
        let project = TempDir::new().unwrap();

        let session = svc
            .start_session(StartSessionRequest {
                project_root: Some(project.path().to_path_buf()),
                provider_override: Some(Provider::Off),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.selected, Provider::Off);

        let result = svc
            .exec_in_session(ExecInSessionRequest {
                session_id: session.id.clone(),
                command: "echo session-ok".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "session-ok\n");

        svc.stop_session(StopSessionRequest {
            session_id: session.id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(
            svc.get_session(&session.id).unwrap().state,
            SessionState::Stopped
        );

        // Second stop is a no-op.
        svc.stop_session(StopSessionRequest {
            session_id: session.id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

        // Exec after stop is rejected.
        let err = svc
            .exec_in_session(ExecInSessionRequest {
                session_id: session.id.clone(),
                command: "echo nope".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VibeboxError::SessionNotActive(_)));
    }

    #[tokio::test]
    async fn test_session_not_found() {
        let svc = Service::new();
        assert!(matches!(
            svc.get_session("s_missing"),
            Err(VibeboxError::SessionNotFound(_))
        ));
        let err = svc
            .exec_in_session(ExecInSessionRequest {
                session_id: "s_missing".into(),
                command: "true".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VibeboxError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let svc = Service::new();
        let project = TempDir::new().unwrap();

        let err = svc
            .exec(ExecRequest {
                project_root: Some(project.path().to_path_buf()),
                provider_override: Some(Provider::Off),
                command: "sleep 5".into(),
                timeout_seconds: 1,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VibeboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_selected_matches_requested_provider() {
        let svc = Service::new();
        let project = TempDir::new().unwrap();
        let result = svc
            .exec(ExecRequest {
                project_root: Some(project.path().to_path_buf()),
                provider_override: Some(Provider::Off),
                command: "true".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.selected, Provider::Off);
    }
}
