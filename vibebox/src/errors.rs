//! Hierarchical error types for the vibebox core.
//!
//! Errors are categorized by recovery path:
//! - [`ImageError`]: artifact download/verification/extraction (user-retryable)
//! - [`VmError`]: apple-vm boot and console failures (fatal per invocation)
//! - top-level variants for validation, selection and session bookkeeping

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type VibeboxResult<T> = Result<T, VibeboxError>;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors that can occur during vibebox operations.
#[derive(Debug, Error)]
pub enum VibeboxError {
    /// Invalid configuration or request input (user-fixable).
    #[error("validation: {0}")]
    Validation(String),

    /// A cwd or mount path resolves outside the project root.
    #[error("cwd {path} escapes project root {root}")]
    PathEscape { path: String, root: String },

    /// An explicitly requested backend failed its probe.
    #[error("requested provider {name} is unavailable ({reason}); hints: {hints:?}")]
    Unavailable {
        name: String,
        reason: String,
        hints: Vec<String>,
    },

    /// The auto selector found no usable backend.
    #[error("auto selection failed: apple-vm unavailable ({apple_reason}); docker unavailable ({docker_reason})")]
    AutoSelection {
        apple_reason: String,
        docker_reason: String,
    },

    /// Image catalog / artifact store failure.
    #[error("image: {0}")]
    Image(#[from] ImageError),

    /// Apple-VM runtime failure.
    #[error("vm: {0}")]
    Vm(#[from] VmError),

    /// No session registered under the given id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but has been stopped.
    #[error("session is not active: {0}")]
    SessionNotActive(String),

    /// The command phase overran the request timeout.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// Project configuration could not be read or written.
    #[error("config: {0}")]
    Config(String),

    /// Invariant violation inside the service (lock poisoning etc.).
    #[error("internal: {0}")]
    Internal(String),

    /// Generic IO error (catch-all).
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Image Errors (download, verify, extract)
// ============================================================================

/// Errors from the artifact store.
///
/// Download failures are retryable: a re-run resumes from the current
/// artifact size. Integrity failures remove the artifact so the next
/// attempt starts clean.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Image id not present in the catalog.
    #[error("unknown image id: {0}")]
    UnknownImage(String),

    /// Catalog entry targets a different architecture than the host.
    #[error("image {id} is for arch={image_arch}, host arch={host_arch}")]
    ArchMismatch {
        id: String,
        image_arch: String,
        host_arch: String,
    },

    /// Non-200/206 status or transport failure.
    #[error("download failed: {0}")]
    Download(String),

    /// sha256 of the downloaded artifact does not match the catalog.
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Extracting the raw disk member from the archive failed.
    #[error("extract {member} from {archive}: {reason}")]
    Extract {
        member: String,
        archive: String,
        reason: String,
    },
}

// ============================================================================
// VM Errors (boot state machine, console, framing)
// ============================================================================

/// Errors from the apple-vm execution core.
#[derive(Debug, Error)]
pub enum VmError {
    /// The virtualization framework rejected the machine configuration.
    #[error("create VM configuration: {0}")]
    ConfigBuild(String),

    /// The machine failed to start or reach the running state.
    #[error("start VM: {0}")]
    Boot(String),

    /// A console-match wait overran its deadline.
    #[error("timed out waiting for console output {0}")]
    ConsoleTimeout(String),

    /// A state-change wait overran its deadline.
    #[error("timed out waiting VM state {want} (current {current})")]
    StateTimeout { want: String, current: String },

    /// The exec produced no parsable exit marker.
    #[error("apple-vm exec did not produce exit marker; last output: {0}")]
    MarkerMissing(String),

    /// The instance disk is held by another VM process.
    #[error("instance disk is locked: {0}")]
    DiskBusy(String),
}

impl VibeboxError {
    /// Shorthand for validation failures built from format strings.
    pub fn validation(msg: impl Into<String>) -> Self {
        VibeboxError::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_hierarchy() {
        let img: VibeboxError = ImageError::UnknownImage("nope".into()).into();
        assert!(matches!(img, VibeboxError::Image(_)));

        let vm: VibeboxError = VmError::Boot("failed".into()).into();
        assert!(matches!(vm, VibeboxError::Vm(_)));
    }

    #[test]
    fn test_error_display() {
        let err = VibeboxError::Image(ImageError::IntegrityMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        });
        assert_eq!(err.to_string(), "image: sha256 mismatch: expected aa, got bb");

        let err = VibeboxError::Unavailable {
            name: "docker".into(),
            reason: "daemon not reachable".into(),
            hints: vec!["start docker daemon".into()],
        };
        assert!(err.to_string().contains("docker"));
        assert!(err.to_string().contains("daemon not reachable"));
    }
}
