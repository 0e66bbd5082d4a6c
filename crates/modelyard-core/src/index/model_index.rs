//! SQLite-backed catalog of model metadata for fast queries.

use crate::error::{ModelyardError, Result};
use crate::library::types::{ModelHashes, ModelMetadata};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A denormalized row in the model index.
///
/// `model_id` is the model directory path relative to the library root.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub model_id: String,
    pub cleaned_name: String,
    pub official_name: String,
    pub model_type: String,
    pub subtype: String,
    pub family: String,
    pub tags: Vec<String>,
    pub hashes: ModelHashes,
    pub size_bytes: u64,
    /// Full metadata blob as stored on disk.
    pub metadata: ModelMetadata,
    pub updated_at: String,
}

/// SQLite model index keyed by library-relative path.
pub struct ModelIndex {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl ModelIndex {
    /// Create or open a model index at the given path.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ModelyardError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(&db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS models (
                model_id TEXT PRIMARY KEY,
                cleaned_name TEXT NOT NULL,
                official_name TEXT NOT NULL,
                model_type TEXT NOT NULL,
                subtype TEXT NOT NULL,
                family TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                blake3 TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                metadata_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_models_type ON models(model_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_models_family ON models(family)",
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| ModelyardError::Database {
            message: "Failed to acquire connection lock".to_string(),
            source: None,
        })
    }

    /// Get the database path.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert or update the index row for a model.
    pub fn upsert(&self, model_id: &str, metadata: &ModelMetadata) -> Result<()> {
        let conn = self.lock()?;

        let tags_json = serde_json::to_string(&metadata.tags)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let hashes = metadata.hashes.clone().unwrap_or_default();

        conn.execute(
            "INSERT INTO models (model_id, cleaned_name, official_name, model_type,
                                 subtype, family, tags_json, sha256, blake3,
                                 size_bytes, metadata_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(model_id) DO UPDATE SET
                 cleaned_name=excluded.cleaned_name,
                 official_name=excluded.official_name,
                 model_type=excluded.model_type,
                 subtype=excluded.subtype,
                 family=excluded.family,
                 tags_json=excluded.tags_json,
                 sha256=excluded.sha256,
                 blake3=excluded.blake3,
                 size_bytes=excluded.size_bytes,
                 metadata_json=excluded.metadata_json,
                 updated_at=excluded.updated_at",
            params![
                model_id,
                metadata.cleaned_name.as_deref().unwrap_or(""),
                metadata.official_name.as_deref().unwrap_or(""),
                metadata.model_type.as_deref().unwrap_or(""),
                metadata.subtype.as_deref().unwrap_or(""),
                metadata.family.as_deref().unwrap_or(""),
                tags_json,
                hashes.sha256.as_deref().unwrap_or(""),
                hashes.blake3.as_deref().unwrap_or(""),
                metadata.size_bytes.unwrap_or(0) as i64,
                metadata_json,
                metadata.updated_date.as_deref().unwrap_or(""),
            ],
        )?;

        debug!("Indexed model: {}", model_id);
        Ok(())
    }

    /// Get a model by ID.
    pub fn get(&self, model_id: &str) -> Result<Option<IndexEntry>> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                &format!("SELECT {} FROM models WHERE model_id = ?1", COLUMNS),
                params![model_id],
                raw_row,
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.into_entry().map_err(|e| {
                ModelyardError::CorruptMetadata {
                    path: self.db_path.clone(),
                    message: format!("index row for {}: {}", model_id, e),
                }
            })?)),
            None => Ok(None),
        }
    }

    /// Delete a model's index row. Returns whether a row was removed.
    pub fn delete(&self, model_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM models WHERE model_id = ?1", params![model_id])?;
        Ok(rows > 0)
    }

    /// List every indexed model.
    ///
    /// Rows whose metadata blob fails to parse are skipped with a warning so
    /// one corrupt record never fails the whole listing.
    pub fn list(&self) -> Result<Vec<IndexEntry>> {
        let conn = self.lock()?;

        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM models ORDER BY model_id", COLUMNS))?;
        let rows = stmt.query_map([], raw_row)?;

        let mut entries = Vec::new();
        for row in rows {
            match row {
                Ok(raw) => {
                    let model_id = raw.model_id.clone();
                    match raw.into_entry() {
                        Ok(entry) => entries.push(entry),
                        Err(e) => warn!("Skipping corrupt index row {}: {}", model_id, e),
                    }
                }
                Err(e) => warn!("Error reading index row: {}", e),
            }
        }

        Ok(entries)
    }

    /// List all model IDs.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT model_id FROM models ORDER BY model_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Find a model carrying the given content hash (either algorithm).
    pub fn find_by_hash(&self, hash: &str) -> Result<Option<IndexEntry>> {
        if hash.is_empty() {
            return Ok(None);
        }
        let conn = self.lock()?;

        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM models WHERE sha256 = ?1 OR blake3 = ?1 LIMIT 1",
                    COLUMNS
                ),
                params![hash],
                raw_row,
            )
            .optional()?;

        match row {
            Some(raw) => match raw.into_entry() {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!("Skipping corrupt index row in hash lookup: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Number of indexed models.
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: usize = conn.query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Remove every row.
    pub fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM models", [])?;
        debug!("Cleared model index");
        Ok(())
    }

    /// Checkpoint the WAL file.
    pub fn checkpoint_wal(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        Ok(())
    }
}

const COLUMNS: &str = "model_id, cleaned_name, official_name, model_type, subtype, family, \
                       tags_json, sha256, blake3, size_bytes, metadata_json, updated_at";

/// Row as stored, before the JSON columns are parsed.
struct RawRow {
    model_id: String,
    cleaned_name: String,
    official_name: String,
    model_type: String,
    subtype: String,
    family: String,
    tags_json: String,
    sha256: String,
    blake3: String,
    size_bytes: i64,
    metadata_json: String,
    updated_at: String,
}

impl RawRow {
    fn into_entry(self) -> std::result::Result<IndexEntry, serde_json::Error> {
        let tags: Vec<String> = serde_json::from_str(&self.tags_json).unwrap_or_default();
        let metadata: ModelMetadata = serde_json::from_str(&self.metadata_json)?;

        Ok(IndexEntry {
            model_id: self.model_id,
            cleaned_name: self.cleaned_name,
            official_name: self.official_name,
            model_type: self.model_type,
            subtype: self.subtype,
            family: self.family,
            tags,
            hashes: ModelHashes {
                sha256: (!self.sha256.is_empty()).then_some(self.sha256),
                blake3: (!self.blake3.is_empty()).then_some(self.blake3),
            },
            size_bytes: self.size_bytes.max(0) as u64,
            metadata,
            updated_at: self.updated_at,
        })
    }
}

fn raw_row(row: &Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        model_id: row.get(0)?,
        cleaned_name: row.get(1)?,
        official_name: row.get(2)?,
        model_type: row.get(3)?,
        subtype: row.get(4)?,
        family: row.get(5)?,
        tags_json: row.get(6)?,
        sha256: row.get(7)?,
        blake3: row.get(8)?,
        size_bytes: row.get(9)?,
        metadata_json: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_index() -> (ModelIndex, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let index = ModelIndex::open(temp_dir.path().join("index.db")).unwrap();
        (index, temp_dir)
    }

    fn test_metadata(name: &str, model_type: &str, tags: &[&str]) -> ModelMetadata {
        ModelMetadata {
            cleaned_name: Some(name.to_string()),
            official_name: Some(name.to_string()),
            model_type: Some(model_type.to_string()),
            family: Some("testfam".to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            hashes: Some(ModelHashes {
                sha256: Some(format!("sha_{}", name)),
                blake3: None,
            }),
            size_bytes: Some(10),
            updated_date: Some("2026-01-01T00:00:00Z".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let (index, _temp) = create_test_index();

        let meta = test_metadata("ckpt1", "diffusion", &["sdxl"]);
        index.upsert("diffusion/sdA/ckpt1", &meta).unwrap();

        let entry = index.get("diffusion/sdA/ckpt1").unwrap().unwrap();
        assert_eq!(entry.model_type, "diffusion");
        assert_eq!(entry.tags, vec!["sdxl"]);
        assert_eq!(entry.metadata.cleaned_name.as_deref(), Some("ckpt1"));
    }

    #[test]
    fn test_upsert_is_idempotent_on_key() {
        let (index, _temp) = create_test_index();

        index
            .upsert("llm/llama/m1", &test_metadata("m1", "llm", &[]))
            .unwrap();
        index
            .upsert("llm/llama/m1", &test_metadata("m1-renamed", "llm", &[]))
            .unwrap();

        assert_eq!(index.count().unwrap(), 1);
        let entry = index.get("llm/llama/m1").unwrap().unwrap();
        assert_eq!(entry.cleaned_name, "m1-renamed");
    }

    #[test]
    fn test_delete() {
        let (index, _temp) = create_test_index();

        index
            .upsert("llm/llama/m1", &test_metadata("m1", "llm", &[]))
            .unwrap();
        assert!(index.delete("llm/llama/m1").unwrap());
        assert!(!index.delete("llm/llama/m1").unwrap());
        assert!(index.get("llm/llama/m1").unwrap().is_none());
    }

    #[test]
    fn test_list_skips_corrupt_rows() {
        let (index, _temp) = create_test_index();

        index
            .upsert("llm/llama/good", &test_metadata("good", "llm", &[]))
            .unwrap();

        // Inject a corrupt metadata blob directly
        {
            let conn = index.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO models VALUES ('llm/llama/bad', 'bad', 'bad', 'llm', '', 'f',
                 '[]', '', '', 0, '{not json', '')",
                [],
            )
            .unwrap();
        }

        let entries = index.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].model_id, "llm/llama/good");
        // The corrupt row is still counted; only the listing skips it
        assert_eq!(index.count().unwrap(), 2);
    }

    #[test]
    fn test_find_by_hash() {
        let (index, _temp) = create_test_index();

        index
            .upsert("llm/llama/m1", &test_metadata("m1", "llm", &[]))
            .unwrap();

        let found = index.find_by_hash("sha_m1").unwrap();
        assert_eq!(found.unwrap().model_id, "llm/llama/m1");

        assert!(index.find_by_hash("missing").unwrap().is_none());
        assert!(index.find_by_hash("").unwrap().is_none());
    }

    #[test]
    fn test_clear_and_count() {
        let (index, _temp) = create_test_index();

        index
            .upsert("a/b/c", &test_metadata("c", "llm", &[]))
            .unwrap();
        index
            .upsert("a/b/d", &test_metadata("d", "llm", &[]))
            .unwrap();
        assert_eq!(index.count().unwrap(), 2);

        index.clear().unwrap();
        assert_eq!(index.count().unwrap(), 0);
    }
}
