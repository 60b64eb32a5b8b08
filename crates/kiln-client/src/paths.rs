//! Lexical path normalisation for explicit source files.
//!
//! Servers run in their own working directory, so every file named on the
//! command line is sent as an absolute path. Normalisation is purely lexical:
//! symlinks are not resolved and the files need not exist.

use std::path::{Component, Path, PathBuf};

/// Joins `path` onto `cwd` when relative and folds `.` and `..` components.
///
/// A `..` at the root stays at the root.
#[must_use]
pub fn absolute_normalised(cwd: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let mut normalised = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other.as_os_str()),
        }
    }
    normalised
}
