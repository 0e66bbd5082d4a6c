//! Mount, permission, sandbox, and symlink-capability checks.

use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

/// Sandbox environments that constrain filesystem access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Flatpak,
    Snap,
    Docker,
    AppImage,
    None,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxKind::Flatpak => "flatpak",
            SandboxKind::Snap => "snap",
            SandboxKind::Docker => "docker",
            SandboxKind::AppImage => "appimage",
            SandboxKind::None => "none",
        }
    }
}

/// Result of sandbox detection.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub kind: SandboxKind,
    pub is_sandboxed: bool,
    /// Operational limitations implied by the environment.
    pub limitations: Vec<String>,
}

impl Default for SandboxInfo {
    fn default() -> Self {
        Self {
            kind: SandboxKind::None,
            is_sandboxed: false,
            limitations: vec![],
        }
    }
}

/// Whether the mount holding `path` is mounted read-only.
///
/// Walks up to the nearest existing ancestor for not-yet-created targets.
/// Unknown mounts report `false` (the writability probe is the ground
/// truth).
pub fn is_path_on_readonly_mount(path: &Path) -> bool {
    let probe = match super::nearest_existing(path).and_then(|p| std::fs::canonicalize(p).ok()) {
        Some(p) => p,
        None => return false,
    };

    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(PathBuf, bool)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if probe.starts_with(mount)
            && best.as_ref().map_or(true, |(b, _)| {
                mount.as_os_str().len() > b.as_os_str().len()
            })
        {
            best = Some((mount.to_path_buf(), disk.is_read_only()));
        }
    }

    best.map(|(_, ro)| ro).unwrap_or(false)
}

/// Whether files can actually be created at (or under) `path`.
///
/// Combines the mount flag with a probe write in the nearest existing
/// ancestor directory; the probe is the ground truth for permission setups
/// that mount flags don't express.
pub fn is_filesystem_writable(path: &Path) -> bool {
    if is_path_on_readonly_mount(path) {
        return false;
    }

    let Some(dir) = super::nearest_existing(path) else {
        return false;
    };
    let dir = if dir.is_dir() {
        dir
    } else {
        match dir.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return false,
        }
    };

    match tempfile::Builder::new()
        .prefix(".modelyard-write-probe")
        .tempfile_in(&dir)
    {
        Ok(file) => {
            drop(file);
            true
        }
        Err(e) => {
            debug!("Write probe failed in {}: {}", dir.display(), e);
            false
        }
    }
}

/// Detect a sandboxed runtime from its well-known markers.
pub fn detect_sandbox_environment() -> SandboxInfo {
    if Path::new("/.flatpak-info").exists() {
        return SandboxInfo {
            kind: SandboxKind::Flatpak,
            is_sandboxed: true,
            limitations: vec![
                "Host filesystem access requires --filesystem grants".to_string(),
                "Symlink targets outside the sandbox may not resolve for other apps"
                    .to_string(),
            ],
        };
    }

    if std::env::var_os("SNAP").is_some() {
        return SandboxInfo {
            kind: SandboxKind::Snap,
            is_sandboxed: true,
            limitations: vec![
                "Home access is confined; personal-files interface required".to_string(),
            ],
        };
    }

    if Path::new("/.dockerenv").exists() {
        return SandboxInfo {
            kind: SandboxKind::Docker,
            is_sandboxed: true,
            limitations: vec![
                "Paths outside bind mounts are invisible to the host".to_string(),
            ],
        };
    }

    if std::env::var_os("APPIMAGE").is_some() {
        return SandboxInfo {
            kind: SandboxKind::AppImage,
            is_sandboxed: true,
            limitations: vec![
                "The mounted AppImage itself is read-only".to_string(),
            ],
        };
    }

    SandboxInfo::default()
}

/// Ground-truth test that `dir` supports symlinks.
///
/// Creates a throwaway canary file and a symlink to it, verifies the link
/// resolves, then deletes both. Catches FAT32/exFAT and sandbox policies
/// that heuristic checks miss.
pub fn check_symlink_capability(dir: &Path) -> bool {
    let Ok(canary) = tempfile::Builder::new()
        .prefix(".modelyard-canary")
        .tempfile_in(dir)
    else {
        return false;
    };

    let link_path = dir.join(format!(".modelyard-canary-link-{}", std::process::id()));
    let created = symlink_file(canary.path(), &link_path).is_ok();

    let resolves = created
        && std::fs::canonicalize(&link_path)
            .map(|resolved| {
                std::fs::canonicalize(canary.path())
                    .map(|c| resolved == c)
                    .unwrap_or(false)
            })
            .unwrap_or(false);

    if created {
        let _ = std::fs::remove_file(&link_path);
    }

    if !resolves {
        debug!("Symlink capability check failed in {}", dir.display());
    }
    resolves
}

#[cfg(unix)]
fn symlink_file(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink_file(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, link)
}
