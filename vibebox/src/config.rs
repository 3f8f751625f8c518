//! Project configuration and the user-global image lock.
//!
//! The project config lives at `<project_root>/.vibebox/config.yaml`; the
//! image lock at `<user_config_dir>/vibebox/images.lock.yaml`. Loading
//! fills unset fields from defaults and validates; saving validates first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{VibeboxError, VibeboxResult};

// ============================================================================
// PROVIDER
// ============================================================================

/// Which sandbox backend should be used.
///
/// `Auto` is a selection strategy, not a concrete runtime. `Macos` is a
/// legacy alias accepted on read and normalized to `AppleVm` before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Off,
    Auto,
    AppleVm,
    Macos,
    Docker,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Off => "off",
            Provider::Auto => "auto",
            Provider::AppleVm => "apple-vm",
            Provider::Macos => "macos",
            Provider::Docker => "docker",
        }
    }

    /// Map legacy provider names to canonical values. Idempotent:
    /// `normalize(normalize(p)) == normalize(p)`.
    pub fn normalize(self) -> Provider {
        match self {
            Provider::Macos => Provider::AppleVm,
            other => other,
        }
    }

    /// Reject non-canonical values. Callers normalize first.
    pub fn validate(&self) -> VibeboxResult<()> {
        match self {
            Provider::Off | Provider::Auto | Provider::AppleVm | Provider::Docker => Ok(()),
            Provider::Macos => Err(VibeboxError::validation(format!(
                "invalid provider: {:?}",
                self.as_str()
            ))),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Provider {
    type Err = VibeboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Provider::Off),
            "auto" | "" => Ok(Provider::Auto),
            "apple-vm" => Ok(Provider::AppleVm),
            "macos" => Ok(Provider::Macos),
            "docker" => Ok(Provider::Docker),
            other => Err(VibeboxError::validation(format!(
                "invalid provider: {:?}",
                other
            ))),
        }
    }
}

// ============================================================================
// PROJECT CONFIG
// ============================================================================

/// Project-level vibebox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_provider")]
    pub provider: Provider,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

fn default_provider() -> Provider {
    Provider::Auto
}

/// VM backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub image_version: String,
    #[serde(default)]
    pub disk_gb: u32,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub ram_mb: u64,
    /// Optional host script executed once when the project instance disk
    /// is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_script: Option<String>,
}

/// Docker backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub image: String,
}

/// Access mode of a host-to-guest mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Ro,
    #[default]
    Rw,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::Ro => "ro",
            MountMode::Rw => "rw",
        }
    }
}

/// A host-to-guest mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub guest: String,
    #[serde(default)]
    pub mode: MountMode,
}

impl Default for Config {
    fn default() -> Self {
        let docker_image = if host_arch() == "arm64" {
            "arm64v8/debian:13"
        } else {
            "debian:13"
        };

        Config {
            provider: Provider::Auto,
            vm: VmConfig {
                image_id: String::new(),
                image_version: String::new(),
                disk_gb: 20,
                cpus: 2,
                ram_mb: 2048,
                provision_script: None,
            },
            docker: DockerConfig {
                image: docker_image.to_string(),
            },
            mounts: vec![Mount {
                host: ".".into(),
                guest: "/workspace".into(),
                mode: MountMode::Rw,
            }],
        }
    }
}

/// Host architecture in catalog vocabulary (`arm64` / `amd64`).
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        other => other,
    }
}

impl Config {
    /// Normalize the provider and enforce field constraints.
    pub fn validate(&mut self) -> VibeboxResult<()> {
        self.provider = self.provider.normalize();
        self.provider.validate()?;

        if matches!(self.provider, Provider::Auto | Provider::AppleVm) {
            if self.vm.cpus < 1 {
                return Err(VibeboxError::validation("vm.cpus must be >= 1"));
            }
            if self.vm.ram_mb < 256 {
                return Err(VibeboxError::validation("vm.ram_mb must be >= 256"));
            }
            if self.vm.disk_gb < 1 {
                return Err(VibeboxError::validation("vm.disk_gb must be >= 1"));
            }
        }
        if matches!(self.provider, Provider::Auto | Provider::Docker)
            && self.docker.image.is_empty()
        {
            return Err(VibeboxError::validation("docker.image is required"));
        }
        for mount in &self.mounts {
            if mount.host.is_empty() || mount.guest.is_empty() {
                return Err(VibeboxError::validation(
                    "mount.host and mount.guest are required",
                ));
            }
        }
        Ok(())
    }
}

/// Path to the project-level config file.
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_state_dir(project_root).join("config.yaml")
}

/// `.vibebox` state directory for a project.
pub fn project_state_dir(project_root: &Path) -> PathBuf {
    project_root.join(".vibebox")
}

/// Project-local instance disk path.
pub fn instance_disk_path(project_root: &Path) -> PathBuf {
    project_state_dir(project_root).join("instance.raw")
}

/// Image lock file location under the user config directory.
pub fn user_lock_path() -> VibeboxResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| VibeboxError::Config("cannot resolve user config directory".into()))?;
    Ok(config_dir.join("vibebox").join("images.lock.yaml"))
}

/// vibebox cache directory under the user cache directory.
pub fn user_cache_dir() -> VibeboxResult<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| VibeboxError::Config("cannot resolve user cache directory".into()))?;
    Ok(cache_dir.join("vibebox"))
}

/// Load a project config, filling unset fields from defaults.
pub fn load(path: &Path) -> VibeboxResult<Config> {
    let raw = std::fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&raw)
        .map_err(|e| VibeboxError::Config(format!("parse {}: {}", path.display(), e)))?;
    cfg.provider = cfg.provider.normalize();

    let defaults = Config::default();
    if cfg.vm.cpus == 0 {
        cfg.vm.cpus = defaults.vm.cpus;
    }
    if cfg.vm.ram_mb == 0 {
        cfg.vm.ram_mb = defaults.vm.ram_mb;
    }
    if cfg.vm.disk_gb == 0 {
        cfg.vm.disk_gb = defaults.vm.disk_gb;
    }
    if cfg.docker.image.is_empty() {
        cfg.docker.image = defaults.docker.image;
    }
    if cfg.mounts.is_empty() {
        cfg.mounts = defaults.mounts;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Validate and write a project config.
pub fn save(path: &Path, cfg: &mut Config) -> VibeboxResult<()> {
    cfg.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = serde_yaml::to_string(cfg)
        .map_err(|e| VibeboxError::Config(format!("serialize config: {}", e)))?;
    std::fs::write(path, payload)?;
    Ok(())
}

// ============================================================================
// IMAGE LOCK
// ============================================================================

/// Tracks downloaded and verified images, keyed by `<id>@<version>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageLock {
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageLockRef>,
}

/// One cached image artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLockRef {
    pub id: String,
    pub version: String,
    pub sha256: String,
    pub artifact_path: PathBuf,
    pub raw_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
}

/// Lock map key for an image id/version pair.
pub fn lock_key(image_id: &str, version: &str) -> String {
    format!("{}@{}", image_id, version)
}

/// Load the image lock; a missing file yields an empty lock.
pub fn load_image_lock(path: &Path) -> VibeboxResult<ImageLock> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ImageLock::default()),
        Err(e) => return Err(e.into()),
    };
    serde_yaml::from_str(&raw)
        .map_err(|e| VibeboxError::Config(format!("parse {}: {}", path.display(), e)))
}

/// Persist the image lock atomically (write-to-temp + rename) with a fresh
/// `updated_at` stamp.
pub fn save_image_lock(path: &Path, lock: &mut ImageLock) -> VibeboxResult<()> {
    lock.updated_at = Some(Utc::now());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = serde_yaml::to_string(lock)
        .map_err(|e| VibeboxError::Config(format!("serialize image lock: {}", e)))?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
