//! Platform and filesystem environment checks.
//!
//! Everything here degrades to a safe default instead of erroring: callers
//! get their answer or a documented conservative fallback, never a panic.

mod drives;
mod validator;

pub use drives::{is_ntfs_dirty, DriveDetector, DriveType};
pub use validator::{
    check_symlink_capability, detect_sandbox_environment, is_filesystem_writable,
    is_path_on_readonly_mount, SandboxInfo, SandboxKind,
};

use std::path::{Path, PathBuf};

/// Walk up to the nearest component of `path` that exists on disk.
///
/// Used to evaluate mount/permission questions for targets that have not
/// been created yet.
pub(crate) fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let mut current = path;
    loop {
        if current.exists() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_nearest_existing_walks_up() {
        let temp = TempDir::new().unwrap();
        let deep = temp.path().join("not").join("yet").join("created");
        assert_eq!(nearest_existing(&deep), Some(temp.path().to_path_buf()));
        assert_eq!(
            nearest_existing(temp.path()),
            Some(temp.path().to_path_buf())
        );
    }
}
