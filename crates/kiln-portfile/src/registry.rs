//! Shared port file handles keyed by absolute path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::PortFileError;
use crate::port_file::PortFile;

/// Hands out one [`PortFile`] per absolute path.
///
/// Sharing the handle means every thread in the process serialises on the
/// same in-process mutex before taking the OS lock. Servers and clients that
/// should not interfere can simply use separate registries.
#[derive(Debug, Default)]
pub struct PortFileRegistry {
    port_files: Mutex<HashMap<PathBuf, Arc<PortFile>>>,
}

impl PortFileRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared handle for `path`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error when `path` cannot be made absolute.
    pub fn port_file(&self, path: &Path) -> Result<Arc<PortFile>, PortFileError> {
        let absolute = std::path::absolute(path).map_err(|source| PortFileError::Resolve {
            path: path.to_path_buf(),
            source,
        })?;
        let mut port_files = self
            .port_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handle = port_files
            .entry(absolute)
            .or_insert_with_key(|key| Arc::new(PortFile::new(key.clone())));
        Ok(Arc::clone(handle))
    }

    /// Number of distinct port files handed out so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.port_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no handle has been handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn same_path_yields_same_handle() {
        let registry = PortFileRegistry::new();
        let first = registry
            .port_file(Path::new("/tmp/kiln-registry/a.port"))
            .expect("absolute path");
        let second = registry
            .port_file(Path::new("/tmp/kiln-registry/a.port"))
            .expect("absolute path");
        let other = registry
            .port_file(Path::new("/tmp/kiln-registry/b.port"))
            .expect("absolute path");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[rstest]
    fn relative_paths_are_anchored_to_the_working_directory() {
        let registry = PortFileRegistry::new();
        let handle = registry
            .port_file(Path::new("kiln.port"))
            .expect("relative path should resolve");
        assert!(handle.path().is_absolute());
    }
}
