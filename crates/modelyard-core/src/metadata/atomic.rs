//! Atomic file operations for safe JSON persistence.
//!
//! Writes go through:
//! 1. Serialize and re-parse the bytes to validate them
//! 2. Write to a temp file with a unique PID+TID suffix
//! 3. Flush and sync so data reaches disk
//! 4. Back up any existing file to `.bak`
//! 5. Atomic rename onto the target path
//!
//! A reader can therefore never observe a half-written file, and every
//! successful overwrite leaves a recovery copy behind.

use crate::error::{ModelyardError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::process;
use std::thread;
use tracing::{debug, warn};

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist. Parse failures are surfaced as
/// [`ModelyardError::CorruptMetadata`] naming the offending file.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path).map_err(|e| ModelyardError::io_with_path(e, path))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| ModelyardError::io_with_path(e, path))?;

    let data: T = serde_json::from_str(&contents).map_err(|e| ModelyardError::CorruptMetadata {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically, backing up any existing file.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| ModelyardError::io_with_path(e, parent))?;
        }
    }

    // Unique temp name so two writers never collide on the scratch file
    let pid = process::id();
    let tid = thread_id();
    let temp_path = path.with_extension(format!("json.{}.{}.tmp", pid, tid));

    let serialized = serde_json::to_string_pretty(data)?;

    // Round-trip validate before anything touches disk
    serde_json::from_str::<serde_json::Value>(&serialized).map_err(|e| ModelyardError::Json {
        message: format!("JSON validation failed: {}", e),
        source: Some(e),
    })?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| ModelyardError::io_with_path(e, &temp_path))?;

        file.write_all(serialized.as_bytes())
            .map_err(|e| ModelyardError::io_with_path(e, &temp_path))?;

        file.flush()
            .map_err(|e| ModelyardError::io_with_path(e, &temp_path))?;

        file.sync_all()
            .map_err(|e| ModelyardError::io_with_path(e, &temp_path))?;
    }

    // Backup failure is not fatal; the write itself still proceeds
    if path.exists() {
        let backup_path = path.with_extension("json.bak");
        if let Err(e) = fs::copy(path, &backup_path) {
            warn!("Failed to create backup {}: {}", backup_path.display(), e);
        } else {
            debug!("Created backup: {}", backup_path.display());
        }
    }

    fs::rename(&temp_path, path).map_err(|e| ModelyardError::io_with_path(e, path))?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Get a unique numeric identifier for the current thread.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    format!("{:?}", thread::current().id()).hash(&mut hasher);
    hasher.finish()
}
