//! Platform link creation, verification, and removal.
//!
//! This is the single filesystem-mutation boundary for links: every call
//! returns an explicit [`Result`] and no helper panics across the API. The
//! mapper and registry compose these primitives rather than touching the
//! filesystem themselves.

use crate::error::{ModelyardError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// How a library file is exposed inside an application directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStrategy {
    /// Symbolic link (default on POSIX).
    Symlink,
    /// Hard link (same filesystem only).
    Hardlink,
    /// Full copy (default on Windows, where symlinks need elevation).
    Copy,
    /// Copy-on-write clone; falls back to copy where unsupported.
    Reflink,
}

impl LinkStrategy {
    /// Canonical lowercase string, as stored in the link registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStrategy::Symlink => "symlink",
            LinkStrategy::Hardlink => "hardlink",
            LinkStrategy::Copy => "copy",
            LinkStrategy::Reflink => "reflink",
        }
    }
}

impl FromStr for LinkStrategy {
    type Err = ModelyardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "symlink" => Ok(LinkStrategy::Symlink),
            "hardlink" => Ok(LinkStrategy::Hardlink),
            "copy" => Ok(LinkStrategy::Copy),
            "reflink" => Ok(LinkStrategy::Reflink),
            other => Err(ModelyardError::Other(format!(
                "Unknown link strategy: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LinkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Platform default: symlink on POSIX, copy on Windows.
pub fn default_strategy() -> LinkStrategy {
    if cfg!(windows) {
        LinkStrategy::Copy
    } else {
        LinkStrategy::Symlink
    }
}

/// State of a previously created link target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing exists at the target path.
    Missing,
    /// A symlink exists but strict resolution fails.
    Broken,
    /// The target resolves to real content.
    Valid,
}

/// Create a link from `source` to `target` using `strategy`.
///
/// Fails with [`ModelyardError::FileNotFound`] if `source` does not exist and
/// with [`ModelyardError::LinkTargetExists`] if something already occupies
/// `target` and `overwrite` is false. Parent directories are created. With
/// `relative`, symlinks store a path relative to the target's parent,
/// falling back to the absolute source when no common ancestor exists.
///
/// Returns the strategy actually used (reflink reports `Copy` when it fell
/// back).
pub fn create_link(
    source: &Path,
    target: &Path,
    strategy: LinkStrategy,
    relative: bool,
    overwrite: bool,
) -> Result<LinkStrategy> {
    if !source.exists() {
        return Err(ModelyardError::FileNotFound(source.to_path_buf()));
    }

    // symlink_metadata so a broken symlink still counts as occupied
    if target.symlink_metadata().is_ok() {
        if !overwrite {
            return Err(ModelyardError::LinkTargetExists(target.to_path_buf()));
        }
        remove_link(target, true)?;
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ModelyardError::io_with_path(e, parent))?;
    }

    let used = match strategy {
        LinkStrategy::Symlink => {
            let link_value = symlink_value(source, target, relative)?;
            create_symlink(&link_value, target).map_err(|e| ModelyardError::LinkFailed {
                strategy: strategy.as_str().to_string(),
                src: source.to_path_buf(),
                target: target.to_path_buf(),
                reason: e.to_string(),
            })?;
            LinkStrategy::Symlink
        }
        LinkStrategy::Hardlink => {
            std::fs::hard_link(source, target).map_err(|e| ModelyardError::LinkFailed {
                strategy: strategy.as_str().to_string(),
                src: source.to_path_buf(),
                target: target.to_path_buf(),
                reason: e.to_string(),
            })?;
            LinkStrategy::Hardlink
        }
        LinkStrategy::Copy => {
            copy_file(source, target)?;
            LinkStrategy::Copy
        }
        LinkStrategy::Reflink => match try_reflink(source, target) {
            Ok(()) => LinkStrategy::Reflink,
            Err(e) => {
                debug!(
                    "Reflink unsupported for {} -> {} ({}), copying instead",
                    source.display(),
                    target.display(),
                    e
                );
                copy_file(source, target)?;
                LinkStrategy::Copy
            }
        },
    };

    debug!(
        "Created {} link {} -> {}",
        used.as_str(),
        target.display(),
        source.display()
    );
    Ok(used)
}

/// Classify the filesystem object at `target`.
pub fn verify_link(target: &Path) -> LinkState {
    let Ok(meta) = target.symlink_metadata() else {
        return LinkState::Missing;
    };

    if meta.file_type().is_symlink() {
        match std::fs::canonicalize(target) {
            Ok(_) => LinkState::Valid,
            Err(_) => LinkState::Broken,
        }
    } else {
        LinkState::Valid
    }
}

/// Remove the link at `target`.
///
/// Symlinks (broken or not) are removed unconditionally. A real file is only
/// removed with `force`, so user data cannot be deleted through the
/// link-management path by accident. Returns whether anything was removed.
pub fn remove_link(target: &Path, force: bool) -> Result<bool> {
    let Ok(meta) = target.symlink_metadata() else {
        return Ok(false);
    };

    if meta.file_type().is_symlink() {
        std::fs::remove_file(target).map_err(|e| ModelyardError::io_with_path(e, target))?;
        debug!("Removed symlink {}", target.display());
        return Ok(true);
    }

    if !force {
        return Err(ModelyardError::RefusedRealFile(target.to_path_buf()));
    }

    if meta.is_dir() {
        return Err(ModelyardError::RefusedRealFile(target.to_path_buf()));
    }

    std::fs::remove_file(target).map_err(|e| ModelyardError::io_with_path(e, target))?;
    debug!("Removed file {}", target.display());
    Ok(true)
}

/// Whether two paths live on different filesystems/mounts (best effort).
pub fn is_cross_filesystem(a: &Path, b: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let dev = |p: &Path| {
            crate::platform::nearest_existing(p)
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.dev())
        };
        match (dev(a), dev(b)) {
            (Some(da), Some(db)) => da != db,
            _ => false,
        }
    }

    #[cfg(not(unix))]
    {
        // Compare path roots (drive letters) as the closest available signal
        a.components().next() != b.components().next()
    }
}

/// The value to store in a symlink pointing at `source`.
fn symlink_value(source: &Path, target: &Path, relative: bool) -> Result<PathBuf> {
    let absolute = std::fs::canonicalize(source)
        .map_err(|e| ModelyardError::io_with_path(e, source))?;

    if !relative {
        return Ok(absolute);
    }

    let Some(parent) = target.parent() else {
        return Ok(absolute);
    };
    // Parent was just created; canonicalize resolves any `..` in it
    let parent = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());

    Ok(relative_to(&absolute, &parent).unwrap_or(absolute))
}

/// Compute `path` relative to `base` (both absolute). `None` when the two
/// share no common ancestor, e.g. different Windows drive prefixes.
fn relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    let path_components: Vec<Component> = path.components().collect();
    let base_components: Vec<Component> = base.components().collect();

    // Roots/prefixes must agree or there is no relative expression
    if path_components.first() != base_components.first() {
        return None;
    }

    let common = path_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..base_components.len() {
        result.push("..");
    }
    for component in &path_components[common..] {
        result.push(component);
    }

    if result.as_os_str().is_empty() {
        result.push(".");
    }
    Some(result)
}

fn copy_file(source: &Path, target: &Path) -> Result<()> {
    std::fs::copy(source, target).map_err(|e| ModelyardError::LinkFailed {
        strategy: "copy".to_string(),
        src: source.to_path_buf(),
        target: target.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link_value: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link_value, target)
}

#[cfg(windows)]
fn create_symlink(link_value: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(link_value, target)
}

/// Clone `source` into `target` via FICLONE (btrfs, XFS, bcachefs).
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn try_reflink(source: &Path, target: &Path) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let src = std::fs::File::open(source)?;
    let dst = std::fs::File::create(target)?;

    // SAFETY: both descriptors are open and owned for the duration of the
    // call; FICLONE reads extents from src and installs them into dst.
    let rc = unsafe { libc::ioctl(dst.as_raw_fd(), libc::FICLONE as _, src.as_raw_fd()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        drop(dst);
        let _ = std::fs::remove_file(target);
        return Err(err);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn try_reflink(_source: &Path, _target: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "reflink not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("weights.safetensors");
        std::fs::write(&source, b"0123456789").unwrap();
        (temp, source)
    }

    #[test]
    fn test_create_symlink_and_verify() {
        let (temp, source) = fixture();
        let target = temp.path().join("app").join("weights.safetensors");

        let used =
            create_link(&source, &target, LinkStrategy::Symlink, false, false).unwrap();
        assert_eq!(used, LinkStrategy::Symlink);
        assert_eq!(verify_link(&target), LinkState::Valid);
        assert_eq!(
            std::fs::canonicalize(&target).unwrap(),
            std::fs::canonicalize(&source).unwrap()
        );
    }

    #[test]
    fn test_create_relative_symlink() {
        let (temp, source) = fixture();
        let target = temp.path().join("app").join("weights.safetensors");

        create_link(&source, &target, LinkStrategy::Symlink, true, false).unwrap();

        let stored = std::fs::read_link(&target).unwrap();
        assert!(stored.is_relative(), "stored value: {:?}", stored);
        assert_eq!(
            std::fs::canonicalize(&target).unwrap(),
            std::fs::canonicalize(&source).unwrap()
        );
    }

    #[test]
    fn test_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let err = create_link(
            &temp.path().join("nope.gguf"),
            &temp.path().join("target.gguf"),
            LinkStrategy::Symlink,
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ModelyardError::FileNotFound(_)));
    }

    #[test]
    fn test_existing_target_conflicts_without_overwrite() {
        let (temp, source) = fixture();
        let target = temp.path().join("taken.safetensors");
        std::fs::write(&target, b"occupied").unwrap();

        let err =
            create_link(&source, &target, LinkStrategy::Symlink, false, false).unwrap_err();
        assert!(matches!(err, ModelyardError::LinkTargetExists(_)));
        // The occupant was not touched
        assert_eq!(std::fs::read(&target).unwrap(), b"occupied");
    }

    #[test]
    fn test_hardlink_and_copy() {
        let (temp, source) = fixture();

        let hard = temp.path().join("hard.safetensors");
        assert_eq!(
            create_link(&source, &hard, LinkStrategy::Hardlink, false, false).unwrap(),
            LinkStrategy::Hardlink
        );
        assert_eq!(std::fs::read(&hard).unwrap(), b"0123456789");

        let copy = temp.path().join("copy.safetensors");
        assert_eq!(
            create_link(&source, &copy, LinkStrategy::Copy, false, false).unwrap(),
            LinkStrategy::Copy
        );
        assert_eq!(std::fs::read(&copy).unwrap(), b"0123456789");
    }

    #[test]
    fn test_reflink_falls_back_to_copy() {
        let (temp, source) = fixture();
        let target = temp.path().join("clone.safetensors");

        // On filesystems without clone support this must degrade, not fail
        let used =
            create_link(&source, &target, LinkStrategy::Reflink, false, false).unwrap();
        assert!(matches!(used, LinkStrategy::Reflink | LinkStrategy::Copy));
        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
    }

    #[cfg(unix)]
    #[test]
    fn test_verify_broken_symlink() {
        let (temp, source) = fixture();
        let target = temp.path().join("link.safetensors");

        create_link(&source, &target, LinkStrategy::Symlink, false, false).unwrap();
        std::fs::remove_file(&source).unwrap();

        assert_eq!(verify_link(&target), LinkState::Broken);
        assert_eq!(verify_link(&temp.path().join("never")), LinkState::Missing);
    }

    #[test]
    fn test_remove_link_guards_real_files() {
        let (temp, source) = fixture();

        let err = remove_link(&source, false).unwrap_err();
        assert!(matches!(err, ModelyardError::RefusedRealFile(_)));
        assert!(source.exists());

        assert!(remove_link(&source, true).unwrap());
        assert!(!source.exists());

        // Missing target reports false, not an error
        assert!(!remove_link(&temp.path().join("gone"), false).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_broken_symlink_unconditionally() {
        let (temp, source) = fixture();
        let target = temp.path().join("link.safetensors");

        create_link(&source, &target, LinkStrategy::Symlink, false, false).unwrap();
        std::fs::remove_file(&source).unwrap();

        assert!(remove_link(&target, false).unwrap());
        assert_eq!(verify_link(&target), LinkState::Missing);
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/lib/models/m1/f.gguf"), Path::new("/apps/a/models")),
            Some(PathBuf::from("../../../lib/models/m1/f.gguf"))
        );
        assert_eq!(
            relative_to(Path::new("/a/b/c"), Path::new("/a/b")),
            Some(PathBuf::from("c"))
        );
        assert_eq!(
            relative_to(Path::new("/a/b"), Path::new("/a/b")),
            Some(PathBuf::from("."))
        );
    }

    #[test]
    fn test_strategy_round_trip() {
        for s in [
            LinkStrategy::Symlink,
            LinkStrategy::Hardlink,
            LinkStrategy::Copy,
            LinkStrategy::Reflink,
        ] {
            assert_eq!(s.as_str().parse::<LinkStrategy>().unwrap(), s);
        }
        assert!("junction".parse::<LinkStrategy>().is_err());
    }
}
