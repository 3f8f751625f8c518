//! Image cache orchestration: download, verify, extract, lock update.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;

use crate::config::{self, ImageLockRef};
use crate::errors::{ImageError, VibeboxError, VibeboxResult};
use crate::images::catalog::Descriptor;
use crate::images::downloader::{download_and_verify, DownloadRequest};
use crate::progress::{Phase, ProgressEvent, ProgressSink};

/// Artifact and raw cache paths produced by a successful prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPaths {
    pub artifact_path: PathBuf,
    pub raw_path: PathBuf,
}

/// Manages catalog downloads and the user-global cache state.
#[derive(Debug, Clone)]
pub struct ImageManager {
    cache_root: PathBuf,
    lock_path: PathBuf,
}

impl ImageManager {
    /// Manager rooted at the user cache and config directories.
    pub fn new() -> VibeboxResult<Self> {
        Ok(Self {
            cache_root: config::user_cache_dir()?,
            lock_path: config::user_lock_path()?,
        })
    }

    /// Manager with explicit roots.
    pub fn with_paths(cache_root: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            cache_root,
            lock_path,
        }
    }

    /// Ensure artifact and extracted raw are present, verified, and
    /// reflected in the lock.
    ///
    /// Interrupted downloads resume on the next call; a digest mismatch
    /// removes the artifact and leaves the lock untouched.
    pub async fn ensure_prepared(
        &self,
        desc: &Descriptor,
        sink: &dyn ProgressSink,
    ) -> VibeboxResult<PreparedPaths> {
        let image_dir = self
            .cache_root
            .join("images")
            .join(desc.id)
            .join(desc.version);
        let artifact = image_dir.join(desc.artifact_name);
        let raw_path = image_dir.join("base.raw");

        tokio::fs::create_dir_all(&image_dir).await?;

        download_and_verify(
            &DownloadRequest {
                url: desc.url.to_string(),
                dest_path: artifact.clone(),
                expected_sha256: desc.sha256.to_string(),
                expected_bytes: desc.size_bytes,
            },
            sink,
        )
        .await?;

        if !raw_path.exists() {
            sink.emit(ProgressEvent::message(
                Phase::Preparing,
                "extracting raw disk",
            ));
            extract_tar_member(&artifact, desc.raw_member, &raw_path).await?;
            sink.emit(ProgressEvent {
                phase: Phase::Preparing,
                message: "raw disk ready".into(),
                percent: 100.0,
                ..ProgressEvent::message(Phase::Preparing, "")
            });
        }

        self.update_lock(desc, &artifact, &raw_path)?;

        sink.emit(ProgressEvent {
            phase: Phase::Completed,
            message: "image ready".into(),
            percent: 100.0,
            done: true,
            ..ProgressEvent::message(Phase::Completed, "")
        });
        Ok(PreparedPaths {
            artifact_path: artifact,
            raw_path,
        })
    }

    fn update_lock(
        &self,
        desc: &Descriptor,
        artifact_path: &Path,
        raw_path: &Path,
    ) -> VibeboxResult<()> {
        let mut lock = config::load_image_lock(&self.lock_path)?;
        lock.images.insert(
            config::lock_key(desc.id, desc.version),
            ImageLockRef {
                id: desc.id.to_string(),
                version: desc.version.to_string(),
                sha256: desc.sha256.to_string(),
                artifact_path: artifact_path.to_path_buf(),
                raw_path: raw_path.to_path_buf(),
                downloaded_at: Utc::now(),
            },
        );
        config::save_image_lock(&self.lock_path, &mut lock)
    }
}

/// Extract exactly one named member from a tar-style archive into
/// `out_path`, streaming through the host `tar` binary. A failed
/// extraction removes the partial output.
async fn extract_tar_member(
    archive_path: &Path,
    member: &str,
    out_path: &Path,
) -> VibeboxResult<()> {
    let out = std::fs::File::create(out_path)?;

    let status = tokio::process::Command::new("tar")
        .arg("-xOf")
        .arg(archive_path)
        .arg(member)
        .stdout(Stdio::from(out))
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .status()
        .await;

    let failed = match status {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => format!("tar exited with {}", status),
        Err(e) => format!("spawn tar: {}", e),
    };
    let _ = std::fs::remove_file(out_path);
    Err(VibeboxError::Image(ImageError::Extract {
        member: member.to_string(),
        archive: archive_path.display().to_string(),
        reason: failed,
    }))
}
