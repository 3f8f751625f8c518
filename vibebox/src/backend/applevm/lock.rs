//! Advisory lock on the project instance disk.
//!
//! Exactly one VM process may open `instance.raw` at a time. The lock is a
//! sibling file held with a non-blocking `flock`, so it is released by the
//! OS when the process exits or crashes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::{VibeboxResult, VmError};

/// Guard holding an exclusive lock next to the instance disk. Dropping the
/// guard releases the lock.
#[derive(Debug)]
pub(crate) struct InstanceLock {
    #[allow(dead_code)] // held for lifetime, not directly accessed
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock for the given instance disk, failing immediately
    /// if another process holds it.
    pub(crate) fn acquire(instance_raw: &Path) -> VibeboxResult<Self> {
        let path = instance_raw.with_extension("lock");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(VmError::DiskBusy(format!(
                        "another vibebox process is using {}",
                        instance_raw.display()
                    ))
                    .into());
                }
                return Err(err.into());
            }
        }

        tracing::debug!(lock_path = %path.display(), "acquired instance disk lock");
        Ok(InstanceLock { file, path })
    }

    #[allow(dead_code)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        tracing::debug!(lock_path = %self.path.display(), "released instance disk lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let disk = dir.path().join("instance.raw");

        {
            let lock = InstanceLock::acquire(&disk).unwrap();
            assert!(lock.path().exists());
        } // released here

        let _again = InstanceLock::acquire(&disk).unwrap();
    }

    #[test]
    fn test_second_holder_rejected_across_threads() {
        let dir = TempDir::new().unwrap();
        let disk = dir.path().join("instance.raw");

        let _held = InstanceLock::acquire(&disk).unwrap();

        // flock is per-open-file, so a second open in this process models a
        // second process.
        let disk2 = disk.clone();
        let result = std::thread::spawn(move || InstanceLock::acquire(&disk2))
            .join()
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("another vibebox process"));
    }

    #[test]
    fn test_locks_on_different_disks_are_independent() {
        let dir = TempDir::new().unwrap();
        let _a = InstanceLock::acquire(&dir.path().join("a.raw")).unwrap();
        let _b = InstanceLock::acquire(&dir.path().join("b.raw")).unwrap();
    }
}
