/// Per-target run guard.
///
/// Holds an exclusive fs2 advisory lock on
/// `<lock_dir>/repsnap-<digest>.lock` for as long as the guard lives, so two
/// runs never fsync-lock the same node concurrently. Released on Drop.

use crate::error::{BackupError, BackupResult};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub struct RunGuard {
    file: File,
    path: PathBuf,
}

impl RunGuard {
    /// Take the guard for `host_port` without blocking
    pub fn acquire(lock_dir: &Path, host_port: &str) -> BackupResult<Self> {
        let path = lock_file_path(lock_dir, host_port);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if is_contended(&e) {
                return Err(BackupError::Busy {
                    target: host_port.to_string(),
                });
            }
            return Err(BackupError::Io(e));
        }

        tracing::debug!("Acquired run guard {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // the lock also goes away with the file handle
        let _ = self.file.unlock();
    }
}

/// Another holder has the lock, as opposed to the lock call itself failing
fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some()
            && err.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

/// Lock file for a target; host:port is hashed to keep the name portable
pub fn lock_file_path(lock_dir: &Path, host_port: &str) -> PathBuf {
    let digest = Sha256::digest(host_port.as_bytes());
    lock_dir.join(format!("repsnap-{}.lock", &hex::encode(digest)[..16]))
}
