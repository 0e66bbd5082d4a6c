//! Core ModelLibrary implementation.
//!
//! The library owns the canonical model directory tree. `metadata.json` files
//! are the source of truth; the SQLite index is a derived cache rebuilt from
//! them, and the link registry records every projection of library content
//! into application directories.
//!
//! One active host process per library is assumed; within the process,
//! metadata writes are serialized per target file.

use crate::config::LibraryConfig;
use crate::error::{ModelyardError, Result};
use crate::index::{IndexEntry, ModelIndex};
use crate::io::IoThrottle;
use crate::library::hashing::verify_sha256;
use crate::library::is_sidecar_file;
use crate::library::naming::{normalize_name, unique_path};
use crate::library::types::{ModelMetadata, ModelOverrides};
use crate::metadata::{atomic_read_json, atomic_write_json};
use crate::registry::{CascadeReport, LinkRegistry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use walkdir::WalkDir;

/// The canonical model store.
///
/// Layout: `library_root/{model_type}/{family}/{cleaned_name}/`, with the
/// library index and link registry databases at the root.
pub struct ModelLibrary {
    library_root: PathBuf,
    index: ModelIndex,
    registry: Arc<LinkRegistry>,
    throttle: Arc<IoThrottle>,
    /// Per-file write locks serializing metadata writes.
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ModelLibrary {
    /// Open (or create) a library, rebuilding the index from disk.
    pub fn open(library_root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_throttle(library_root, Arc::new(IoThrottle::default()))
    }

    /// Open with an injected I/O throttle (shared with other components).
    pub fn open_with_throttle(
        library_root: impl Into<PathBuf>,
        throttle: Arc<IoThrottle>,
    ) -> Result<Self> {
        let library_root = library_root.into();
        std::fs::create_dir_all(&library_root)
            .map_err(|e| ModelyardError::io_with_path(e, &library_root))?;

        let index = ModelIndex::open(library_root.join(LibraryConfig::INDEX_DB_FILENAME))?;
        let registry = Arc::new(LinkRegistry::open(
            library_root.join(crate::config::RegistryConfig::DB_FILENAME),
        )?);

        let library = Self {
            library_root,
            index,
            registry,
            throttle,
            write_locks: Mutex::new(HashMap::new()),
        };

        // The index is disposable; a failed rebuild leaves it stale, not the
        // library broken
        if let Err(e) = library.rebuild_index() {
            warn!("Failed to rebuild model index on startup: {}", e);
        }

        Ok(library)
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub fn index(&self) -> &ModelIndex {
        &self.index
    }

    pub fn link_registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    pub fn io_throttle(&self) -> &Arc<IoThrottle> {
        &self.throttle
    }

    // ========================================
    // Directory structure
    // ========================================

    /// Canonical path for a model: `{model_type}/{family}/{cleaned_name}`,
    /// each component normalized.
    pub fn build_model_path(&self, model_type: &str, family: &str, cleaned_name: &str) -> PathBuf {
        let max = LibraryConfig::MAX_NAME_LENGTH;
        self.library_root
            .join(normalize_name(model_type, max, "unknown"))
            .join(normalize_name(family, max, "unknown"))
            .join(normalize_name(
                cleaned_name,
                max,
                LibraryConfig::NAME_FALLBACK,
            ))
    }

    /// Like [`Self::build_model_path`], but collision-resolved: an occupied
    /// directory yields the first free `-2/-3…` sibling.
    pub fn allocate_model_dir(
        &self,
        model_type: &str,
        family: &str,
        cleaned_name: &str,
    ) -> PathBuf {
        unique_path(&self.build_model_path(model_type, family, cleaned_name))
    }

    /// The absolute directory for a model ID.
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.library_root.join(model_id)
    }

    /// The model ID (library-relative path) for a model directory.
    pub fn model_id_for(&self, model_dir: &Path) -> Option<String> {
        model_dir
            .strip_prefix(&self.library_root)
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Iterate over all model directories (directories holding a
    /// `metadata.json`), at any depth.
    pub fn model_dirs(&self) -> impl Iterator<Item = PathBuf> + '_ {
        WalkDir::new(&self.library_root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file() && e.file_name() == LibraryConfig::METADATA_FILENAME
            })
            .filter_map(|e| e.path().parent().map(|p| p.to_path_buf()))
    }

    /// Files of a model eligible for linking (sidecars excluded).
    pub fn model_files(&self, model_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(model_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_sidecar_file(&name) {
                continue;
            }
            files.push(entry.path().to_path_buf());
        }
        files.sort();
        Ok(files)
    }

    // ========================================
    // Metadata operations
    // ========================================

    /// Load a model's metadata sidecar.
    pub fn load_metadata(&self, model_dir: &Path) -> Result<Option<ModelMetadata>> {
        atomic_read_json(&model_dir.join(LibraryConfig::METADATA_FILENAME))
    }

    /// Save a model's metadata sidecar atomically (with `.bak` on
    /// overwrite), serialized against concurrent writers of the same file.
    pub fn save_metadata(&self, model_dir: &Path, metadata: &ModelMetadata) -> Result<()> {
        let path = model_dir.join(LibraryConfig::METADATA_FILENAME);
        let _guard = self.file_lock(&path);
        let _held = _guard.lock().unwrap_or_else(|e| e.into_inner());
        atomic_write_json(&path, metadata)
    }

    /// Load a model's overrides sidecar.
    pub fn load_overrides(&self, model_dir: &Path) -> Result<Option<ModelOverrides>> {
        atomic_read_json(&model_dir.join(LibraryConfig::OVERRIDES_FILENAME))
    }

    /// Save a model's overrides sidecar with the same discipline as
    /// metadata.
    pub fn save_overrides(&self, model_dir: &Path, overrides: &ModelOverrides) -> Result<()> {
        let path = model_dir.join(LibraryConfig::OVERRIDES_FILENAME);
        let _guard = self.file_lock(&path);
        let _held = _guard.lock().unwrap_or_else(|e| e.into_inner());
        atomic_write_json(&path, overrides)
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================
    // Index operations
    // ========================================

    /// Read one model directory's metadata and upsert its index row.
    pub fn index_model_dir(&self, model_dir: &Path) -> Result<()> {
        let metadata = self
            .load_metadata(model_dir)?
            .ok_or_else(|| ModelyardError::ModelNotFound {
                model_id: model_dir.display().to_string(),
            })?;

        let model_id = self.model_id_for(model_dir).ok_or_else(|| {
            ModelyardError::Other(format!(
                "Path {} is outside the library root",
                model_dir.display()
            ))
        })?;

        self.index.upsert(&model_id, &metadata)
    }

    /// Rebuild the entire index from the `metadata.json` files on disk.
    ///
    /// The authoritative recovery path when the index file is lost or
    /// corrupted. Unreadable metadata is skipped with a warning.
    pub fn rebuild_index(&self) -> Result<usize> {
        self.index.clear()?;

        let mut count = 0usize;
        for model_dir in self.model_dirs() {
            match self.load_metadata(&model_dir) {
                Ok(Some(metadata)) => {
                    if let Some(model_id) = self.model_id_for(&model_dir) {
                        if self.index.upsert(&model_id, &metadata).is_ok() {
                            count += 1;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping {}: {}", model_dir.display(), e),
            }
        }

        self.index.checkpoint_wal()?;
        info!("Rebuilt index with {} models", count);
        Ok(count)
    }

    /// Rebuild the index while re-verifying stored SHA-256 hashes against
    /// file contents. Slow; hashing is throttled per drive.
    pub fn deep_verify(&self) -> Result<DeepVerifyReport> {
        let mut report = DeepVerifyReport::default();
        self.index.clear()?;

        for model_dir in self.model_dirs() {
            report.scanned += 1;

            let metadata = match self.load_metadata(&model_dir) {
                Ok(Some(m)) => m,
                Ok(None) => continue,
                Err(e) => {
                    report.errors.push((model_dir.clone(), e.to_string()));
                    continue;
                }
            };

            if let Some(expected) = metadata
                .hashes
                .as_ref()
                .and_then(|h| h.sha256.as_deref())
                .filter(|h| !h.is_empty())
            {
                if let Some(primary) = find_primary_model_file(&model_dir) {
                    let _permit = self.throttle.acquire(&primary);
                    match verify_sha256(&primary, expected) {
                        Ok(()) => report.verified += 1,
                        Err(ModelyardError::HashMismatch { expected, actual }) => {
                            warn!(
                                "Hash mismatch for {}: expected {}, got {}",
                                primary.display(),
                                expected,
                                actual
                            );
                            report.mismatches.push(model_dir.clone());
                        }
                        Err(e) => report.errors.push((model_dir.clone(), e.to_string())),
                    }
                }
            }

            if let Some(model_id) = self.model_id_for(&model_dir) {
                if self.index.upsert(&model_id, &metadata).is_ok() {
                    report.indexed += 1;
                }
            }
        }

        self.index.checkpoint_wal()?;
        info!(
            "Deep verify: {} scanned, {} indexed, {} verified, {} mismatches, {} errors",
            report.scanned,
            report.indexed,
            report.verified,
            report.mismatches.len(),
            report.errors.len()
        );
        Ok(report)
    }

    // ========================================
    // Query operations
    // ========================================

    /// List every indexed model.
    pub fn list_models(&self) -> Result<Vec<IndexEntry>> {
        self.index.list()
    }

    /// Get one model by ID.
    pub fn get_model(&self, model_id: &str) -> Result<Option<IndexEntry>> {
        self.index.get(model_id)
    }

    // ========================================
    // Model management
    // ========================================

    /// Permanently remove a model: cascade-delete its links, drop its index
    /// row, delete its directory, and prune now-empty parents.
    pub fn delete_model(&self, model_id: &str) -> Result<CascadeReport> {
        let model_dir = self.model_dir(model_id);
        if !model_dir.exists() {
            return Err(ModelyardError::ModelNotFound {
                model_id: model_id.to_string(),
            });
        }

        // Links first so no application-visible file dangles
        let cascade = self.registry.delete_links_for_model(model_id)?;

        self.index.delete(model_id)?;

        std::fs::remove_dir_all(&model_dir)
            .map_err(|e| ModelyardError::io_with_path(e, &model_dir))?;

        // Prune empty family/type directories; remove_dir only succeeds on
        // empty ones
        if let Some(parent) = model_dir.parent() {
            let _ = std::fs::remove_dir(parent);
            if let Some(grandparent) = parent.parent() {
                if grandparent != self.library_root {
                    let _ = std::fs::remove_dir(grandparent);
                }
            }
        }

        info!("Deleted model {}", model_id);
        Ok(cascade)
    }

    /// Total size in bytes of everything under the model directories.
    pub fn total_size(&self) -> u64 {
        let mut total = 0u64;
        for model_dir in self.model_dirs() {
            for entry in WalkDir::new(&model_dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    if let Ok(meta) = entry.metadata() {
                        total += meta.len();
                    }
                }
            }
        }
        total
    }

    /// Aggregate statistics over the indexed models.
    pub fn stats(&self) -> Result<LibraryStats> {
        let models = self.list_models()?;
        let mut stats = LibraryStats {
            total_models: models.len(),
            ..Default::default()
        };

        for model in &models {
            if !model.model_type.is_empty() {
                *stats.by_type.entry(model.model_type.clone()).or_insert(0) += 1;
            }
            if !model.family.is_empty() {
                *stats.by_family.entry(model.family.clone()).or_insert(0) += 1;
            }
        }

        stats.total_size_bytes = self.total_size();
        Ok(stats)
    }
}

/// The largest non-sidecar file in a model directory; hash verification
/// targets this file.
fn find_primary_model_file(model_dir: &Path) -> Option<PathBuf> {
    let mut largest: Option<(PathBuf, u64)> = None;

    for entry in WalkDir::new(model_dir)
        .min_depth(1)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_sidecar_file(&name) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let size = meta.len();
            if largest.as_ref().map_or(true, |(_, s)| size > *s) {
                largest = Some((entry.path().to_path_buf(), size));
            }
        }
    }

    largest.map(|(path, _)| path)
}

/// Result of [`ModelLibrary::deep_verify`].
#[derive(Debug, Clone, Default)]
pub struct DeepVerifyReport {
    pub scanned: usize,
    pub indexed: usize,
    pub verified: usize,
    pub mismatches: Vec<PathBuf>,
    pub errors: Vec<(PathBuf, String)>,
}

/// Library statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LibraryStats {
    pub total_models: usize,
    pub total_size_bytes: u64,
    pub by_type: HashMap<String, usize>,
    pub by_family: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::types::ModelHashes;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ModelLibrary) {
        let temp = TempDir::new().unwrap();
        let library = ModelLibrary::open(temp.path()).unwrap();
        (temp, library)
    }

    fn write_model(
        library: &ModelLibrary,
        model_type: &str,
        family: &str,
        name: &str,
    ) -> PathBuf {
        let dir = library.build_model_path(model_type, family, name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("weights.safetensors"), b"0123456789").unwrap();

        let metadata = ModelMetadata {
            model_id: library.model_id_for(&dir),
            model_type: Some(model_type.to_string()),
            family: Some(family.to_string()),
            cleaned_name: Some(name.to_string()),
            tags: vec!["sdxl".to_string()],
            size_bytes: Some(10),
            updated_date: Some("2026-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        library.save_metadata(&dir, &metadata).unwrap();
        dir
    }

    #[test]
    fn test_open_creates_databases() {
        let (temp, library) = setup();
        assert_eq!(library.library_root(), temp.path());
        assert!(temp.path().join(LibraryConfig::INDEX_DB_FILENAME).exists());
        assert!(temp
            .path()
            .join(crate::config::RegistryConfig::DB_FILENAME)
            .exists());
    }

    #[test]
    fn test_build_model_path_normalizes() {
        let (_temp, library) = setup();
        let path = library.build_model_path("diffusion", "Stable Diffusion", "SDXL Base 1.0");
        assert!(path.ends_with("diffusion/Stable_Diffusion/SDXL_Base_10"));
    }

    #[test]
    fn test_allocate_model_dir_resolves_collisions() {
        let (_temp, library) = setup();

        let first = library.allocate_model_dir("llm", "llama", "m");
        std::fs::create_dir_all(&first).unwrap();

        let second = library.allocate_model_dir("llm", "llama", "m");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("m-2"));
    }

    #[test]
    fn test_metadata_round_trip_with_backup() {
        let (_temp, library) = setup();
        let dir = write_model(&library, "llm", "llama", "m1");

        let mut metadata = library.load_metadata(&dir).unwrap().unwrap();
        assert_eq!(metadata.family.as_deref(), Some("llama"));

        metadata.notes = Some("updated".to_string());
        library.save_metadata(&dir, &metadata).unwrap();

        assert!(dir.join("metadata.json.bak").exists());
        let reloaded = library.load_metadata(&dir).unwrap().unwrap();
        assert_eq!(reloaded.notes.as_deref(), Some("updated"));
    }

    #[test]
    fn test_overrides_round_trip() {
        let (_temp, library) = setup();
        let dir = write_model(&library, "llm", "llama", "m1");

        assert!(library.load_overrides(&dir).unwrap().is_none());

        let mut overrides = ModelOverrides::default();
        overrides
            .version_ranges
            .insert("comfyui".into(), ">=0.5".into());
        library.save_overrides(&dir, &overrides).unwrap();

        let loaded = library.load_overrides(&dir).unwrap().unwrap();
        assert!(loaded.allows("comfyui", "0.6.0"));
        assert!(!loaded.allows("comfyui", "0.4.0"));
    }

    #[test]
    fn test_rebuild_index_from_disk() {
        let (temp, library) = setup();
        for i in 0..3 {
            write_model(&library, "llm", "llama", &format!("model-{}", i));
        }

        let count = library.rebuild_index().unwrap();
        assert_eq!(count, 3);
        assert_eq!(library.list_models().unwrap().len(), 3);

        // A fresh library over the same root recovers the index on open
        drop(library);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(
                temp.path()
                    .join(format!("{}{}", LibraryConfig::INDEX_DB_FILENAME, suffix)),
            );
        }
        let reopened = ModelLibrary::open(temp.path()).unwrap();
        assert_eq!(reopened.list_models().unwrap().len(), 3);
    }

    #[test]
    fn test_rebuild_skips_corrupt_metadata() {
        let (_temp, library) = setup();
        write_model(&library, "llm", "llama", "good");

        let bad_dir = library.build_model_path("llm", "llama", "bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join("metadata.json"), "{broken").unwrap();

        let count = library.rebuild_index().unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_model_files_excludes_sidecars() {
        let (_temp, library) = setup();
        let dir = write_model(&library, "diffusion", "sdA", "ckpt1");
        std::fs::write(dir.join("config.yaml"), b"cfg").unwrap();

        // Force a backup sidecar to exist
        let metadata = library.load_metadata(&dir).unwrap().unwrap();
        library.save_metadata(&dir, &metadata).unwrap();

        let files = library.model_files(&dir).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["config.yaml", "weights.safetensors"]);
    }

    #[test]
    fn test_deep_verify_flags_mismatch() {
        let (_temp, library) = setup();
        let dir = write_model(&library, "llm", "llama", "m1");

        let mut metadata = library.load_metadata(&dir).unwrap().unwrap();
        metadata.hashes = Some(ModelHashes {
            sha256: Some("0".repeat(64)),
            blake3: None,
        });
        library.save_metadata(&dir, &metadata).unwrap();

        let report = library.deep_verify().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.mismatches.len(), 1);

        // Correct hash verifies clean
        let hash = crate::library::compute_dual_hash(dir.join("weights.safetensors")).unwrap();
        metadata.hashes = Some(ModelHashes {
            sha256: Some(hash.sha256),
            blake3: None,
        });
        library.save_metadata(&dir, &metadata).unwrap();

        let report = library.deep_verify().unwrap();
        assert_eq!(report.verified, 1);
        assert!(report.mismatches.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_model_cascades_and_prunes() {
        let (temp, library) = setup();
        let dir = write_model(&library, "diffusion", "sdA", "ckpt1");
        library.rebuild_index().unwrap();
        let model_id = library.model_id_for(&dir).unwrap();

        // Expose the model into an app directory
        let source = dir.join("weights.safetensors");
        let target = temp.path().join("app/models/weights.safetensors");
        crate::linker::create_link(
            &source,
            &target,
            crate::linker::LinkStrategy::Symlink,
            false,
            false,
        )
        .unwrap();
        library
            .link_registry()
            .register_link(&crate::registry::LinkSpec {
                model_id: model_id.clone(),
                source_path: source,
                target_path: target.clone(),
                link_type: crate::linker::LinkStrategy::Symlink,
                app_id: "comfyui".into(),
                app_version: None,
                is_external: false,
            })
            .unwrap();

        let report = library.delete_model(&model_id).unwrap();
        assert_eq!(report.rows_removed, 1);

        assert!(!dir.exists());
        // Empty family and type directories were pruned
        assert!(!temp.path().join("diffusion").exists());
        assert!(target.symlink_metadata().is_err());
        assert!(library.get_model(&model_id).unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_model_is_not_found() {
        let (_temp, library) = setup();
        let err = library.delete_model("llm/none/missing").unwrap_err();
        assert!(matches!(err, ModelyardError::ModelNotFound { .. }));
    }

    #[test]
    fn test_stats() {
        let (_temp, library) = setup();
        write_model(&library, "llm", "llama", "m1");
        write_model(&library, "diffusion", "sdA", "m2");
        write_model(&library, "diffusion", "sdA", "m3");
        library.rebuild_index().unwrap();

        let stats = library.stats().unwrap();
        assert_eq!(stats.total_models, 3);
        assert_eq!(stats.by_type.get("diffusion"), Some(&2));
        assert_eq!(stats.by_family.get("sdA"), Some(&2));
        assert_eq!(stats.total_size_bytes, 30);
    }
}
