//! Port file handle and its lock guard.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::PORTFILE_TARGET;
use crate::error::PortFileError;
use crate::files::{atomic_write, remove_if_exists};
use crate::values::PortFileValues;

const LOCK_SUFFIX: &str = ".lock";
const STOP_SUFFIX: &str = ".stop";
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to a port file on disk.
///
/// The handle itself holds no cached values: every query goes back to disk
/// under the lock, so a record rewritten by another process is always seen.
#[derive(Debug)]
pub struct PortFile {
    path: PathBuf,
    lock_path: PathBuf,
    stop_path: PathBuf,
    in_process: Mutex<()>,
}

impl PortFile {
    /// Creates a handle for `path` without touching the filesystem.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_path: sibling(&path, LOCK_SUFFIX),
            stop_path: sibling(&path, STOP_SUFFIX),
            path,
            in_process: Mutex::new(()),
        }
    }

    /// Path of the record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the stop sentinel.
    #[must_use]
    pub fn stop_path(&self) -> &Path {
        &self.stop_path
    }

    /// Blocks until this thread holds both the in-process and the OS lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory or lock file cannot be created or
    /// the OS lock cannot be taken.
    pub fn lock(&self) -> Result<PortFileLock<'_>, PortFileError> {
        let guard = self
            .in_process
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| self.lock_error(source))?;
        file.lock_exclusive()
            .map_err(|source| self.lock_error(source))?;
        Ok(PortFileLock {
            port_file: self,
            file,
            _guard: guard,
        })
    }

    /// Returns true when a valid (port, cookie) pair is recorded.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock cannot be taken or the record cannot be
    /// read.
    pub fn contains_port_info(&self) -> Result<bool, PortFileError> {
        let lock = self.lock()?;
        Ok(lock.values()?.is_some_and(|values| values.is_valid()))
    }

    /// Re-reads the record and compares it with the caller's own values.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock cannot be taken or the record cannot be
    /// read.
    pub fn still_my_values(&self, port: u16, cookie: u64) -> Result<bool, PortFileError> {
        let lock = self.lock()?;
        Ok(lock
            .values()?
            .is_some_and(|values| values.matches(port, cookie)))
    }

    /// Returns true when the record file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns true when someone asked the owning server to stop.
    #[must_use]
    pub fn marked_for_stop(&self) -> bool {
        self.stop_path.exists()
    }

    /// Creates the stop sentinel under the lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock cannot be taken or the sentinel cannot
    /// be written.
    pub fn mark_for_stop(&self) -> Result<(), PortFileError> {
        self.lock()?.mark_for_stop()
    }

    /// Removes the record and the stop sentinel under the lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock cannot be taken or a file cannot be
    /// removed.
    pub fn delete(&self) -> Result<(), PortFileError> {
        self.lock()?.delete()
    }

    /// Polls until a valid record appears or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`PortFileError::Timeout`] when no valid record appeared, or
    /// any lock error. A malformed record is treated as not yet written.
    pub fn wait_for_valid_values(
        &self,
        timeout: Duration,
    ) -> Result<PortFileValues, PortFileError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.lock()?.values() {
                Ok(Some(values)) if values.is_valid() => return Ok(values),
                Ok(_) => {}
                Err(error @ PortFileError::Decode { .. }) => {
                    debug!(target: PORTFILE_TARGET, %error, "ignoring malformed port file");
                }
                Err(error) => return Err(error),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PortFileError::Timeout {
                    path: self.path.clone(),
                    timeout,
                });
            }
            thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn ensure_parent(&self) -> Result<(), PortFileError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| PortFileError::MissingParent {
                path: self.path.clone(),
            })?;
        fs::create_dir_all(parent).map_err(|source| PortFileError::Directory {
            path: parent.to_path_buf(),
            source,
        })
    }

    fn lock_error(&self, source: io::Error) -> PortFileError {
        PortFileError::Lock {
            path: self.lock_path.clone(),
            source,
        }
    }
}

/// Exclusive access to a port file; released on drop.
#[derive(Debug)]
pub struct PortFileLock<'a> {
    port_file: &'a PortFile,
    file: File,
    _guard: MutexGuard<'a, ()>,
}

impl PortFileLock<'_> {
    /// Reads the record, returning `None` when no record exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or holds malformed JSON.
    pub fn values(&self) -> Result<Option<PortFileValues>, PortFileError> {
        let path = self.port_file.path();
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PortFileError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| PortFileError::Decode {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Replaces the record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be serialised or persisted.
    pub fn set_values(&self, values: &PortFileValues) -> Result<(), PortFileError> {
        let path = self.port_file.path();
        let mut payload = serde_json::to_vec(values).map_err(|source| PortFileError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        payload.push(b'\n');
        atomic_write(path, &payload).map_err(|source| PortFileError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            target: PORTFILE_TARGET,
            file = %path.display(),
            port = values.port,
            pid = values.pid,
            "port file written"
        );
        Ok(())
    }

    /// Creates the stop sentinel.
    ///
    /// # Errors
    ///
    /// Returns an error when the sentinel cannot be written.
    pub fn mark_for_stop(&self) -> Result<(), PortFileError> {
        let path = self.port_file.stop_path();
        File::create(path).map_err(|source| PortFileError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            target: PORTFILE_TARGET,
            file = %path.display(),
            "port file marked for stop"
        );
        Ok(())
    }

    /// Removes the record and the stop sentinel.
    ///
    /// # Errors
    ///
    /// Returns an error when either file exists but cannot be removed.
    pub fn delete(&self) -> Result<(), PortFileError> {
        for path in [self.port_file.path(), self.port_file.stop_path()] {
            let removed = remove_if_exists(path).map_err(|source| PortFileError::Remove {
                path: path.to_path_buf(),
                source,
            })?;
            if removed {
                info!(target: PORTFILE_TARGET, file = %path.display(), "removed");
            }
        }
        Ok(())
    }

    /// Releases the lock explicitly.
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for PortFileLock<'_> {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            warn!(
                target: PORTFILE_TARGET,
                file = %self.port_file.lock_path.display(),
                %error,
                "failed to release port file lock"
            );
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(OsString::new, ToOwned::to_owned);
    name.push(suffix);
    path.with_file_name(name)
}
