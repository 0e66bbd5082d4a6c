//! Drive classification and NTFS state checks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::Disks;
use tracing::debug;

/// Physical characteristics of the drive backing a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveType {
    Ssd,
    Hdd,
    Unknown,
}

impl std::fmt::Display for DriveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveType::Ssd => write!(f, "SSD"),
            DriveType::Hdd => write!(f, "HDD"),
            DriveType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Resolves paths to their backing mount point and drive type.
///
/// Results are cached per resolved mount point; enumeration of the system
/// disk list only happens on cache misses.
#[derive(Debug, Default)]
pub struct DriveDetector {
    cache: Mutex<HashMap<PathBuf, DriveType>>,
}

impl DriveDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mount point backing `path` (longest-prefix match over the mounted
    /// disks, using the nearest existing ancestor for paths not yet created).
    pub fn mount_point(&self, path: &Path) -> PathBuf {
        let probe = super::nearest_existing(path)
            .and_then(|p| std::fs::canonicalize(p).ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        let disks = Disks::new_with_refreshed_list();
        let mut best: Option<PathBuf> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if probe.starts_with(mount)
                && best.as_deref().map_or(true, |b| {
                    mount.as_os_str().len() > b.as_os_str().len()
                })
            {
                best = Some(mount.to_path_buf());
            }
        }
        best.unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Classify the drive backing `path`.
    pub fn drive_type(&self, path: &Path) -> DriveType {
        let probe = super::nearest_existing(path)
            .and_then(|p| std::fs::canonicalize(p).ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        let disks = Disks::new_with_refreshed_list();
        let mut best: Option<usize> = None;
        for (i, disk) in disks.list().iter().enumerate() {
            let mount = disk.mount_point();
            if probe.starts_with(mount)
                && best.map_or(true, |b| {
                    mount.as_os_str().len() > disks.list()[b].mount_point().as_os_str().len()
                })
            {
                best = Some(i);
            }
        }

        let Some(best) = best else {
            return DriveType::Unknown;
        };
        let disk = &disks.list()[best];
        let mount = disk.mount_point().to_path_buf();

        if let Ok(cache) = self.cache.lock() {
            if let Some(&cached) = cache.get(&mount) {
                return cached;
            }
        }

        let detected = classify(disk);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(mount, detected);
        }
        detected
    }
}

fn classify(disk: &sysinfo::Disk) -> DriveType {
    match disk.kind() {
        sysinfo::DiskKind::SSD => DriveType::Ssd,
        sysinfo::DiskKind::HDD => DriveType::Hdd,
        sysinfo::DiskKind::Unknown(_) => {
            // sysinfo could not tell; ask the block layer directly
            rotational_lookup(disk.name().to_string_lossy().as_ref())
                .unwrap_or(DriveType::Unknown)
        }
    }
}

/// Read `/sys/block/<parent-device>/queue/rotational` for a device node.
#[cfg(target_os = "linux")]
fn rotational_lookup(device: &str) -> Option<DriveType> {
    let name = device.strip_prefix("/dev/")?;

    // Partition -> parent device: sda1 -> sda, nvme0n1p2 -> nvme0n1
    let parent = if name.starts_with("nvme") {
        match name.rfind('p') {
            Some(pos) => &name[..pos],
            None => name,
        }
    } else {
        name.trim_end_matches(|c: char| c.is_ascii_digit())
    };

    let flag = std::fs::read_to_string(format!("/sys/block/{}/queue/rotational", parent)).ok()?;
    match flag.trim() {
        "0" => Some(DriveType::Ssd),
        "1" => Some(DriveType::Hdd),
        _ => None,
    }
}

#[cfg(not(target_os = "linux"))]
fn rotational_lookup(_device: &str) -> Option<DriveType> {
    None
}

/// Whether the NTFS volume holding `path` carries the dirty (unclean
/// unmount) flag.
///
/// Only meaningful on NTFS: any non-NTFS filesystem, a missing check tool,
/// or an unparsable answer all yield `false`. A wrong `false` merely skips a
/// warning; a wrong `true` would block the user, so this fails safe.
pub fn is_ntfs_dirty(path: &Path) -> bool {
    let probe = match super::nearest_existing(path).and_then(|p| std::fs::canonicalize(p).ok()) {
        Some(p) => p,
        None => return false,
    };

    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(PathBuf, String, PathBuf)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if probe.starts_with(mount)
            && best.as_ref().map_or(true, |(b, _, _)| {
                mount.as_os_str().len() > b.as_os_str().len()
            })
        {
            best = Some((
                mount.to_path_buf(),
                disk.file_system().to_string_lossy().to_lowercase(),
                PathBuf::from(disk.name()),
            ));
        }
    }

    let Some((mount, fs, device)) = best else {
        return false;
    };

    if !matches!(fs.as_str(), "ntfs" | "ntfs3" | "fuseblk") {
        return false;
    }

    query_dirty_flag(&mount, &device)
}

#[cfg(windows)]
fn query_dirty_flag(mount: &Path, _device: &Path) -> bool {
    let drive = mount.to_string_lossy().trim_end_matches('\\').to_string();
    match std::process::Command::new("fsutil")
        .args(["dirty", "query", &drive])
        .output()
    {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout).to_lowercase();
            text.contains("is dirty")
        }
        Err(e) => {
            debug!("fsutil unavailable, assuming clean volume: {}", e);
            false
        }
    }
}

#[cfg(not(windows))]
fn query_dirty_flag(_mount: &Path, device: &Path) -> bool {
    // ntfsfix --no-action reports without repairing
    match std::process::Command::new("ntfsfix")
        .arg("--no-action")
        .arg(device)
        .output()
    {
        Ok(out) => {
            let text = format!(
                "{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            )
            .to_lowercase();
            text.contains("dirty") || text.contains("scheduled for check")
        }
        Err(e) => {
            debug!("ntfsfix unavailable, assuming clean volume: {}", e);
            false
        }
    }
}
