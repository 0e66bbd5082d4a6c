//! SQLite-backed link registry.
//!
//! An independent store (no foreign keys into the model index) recording
//! every link created on the host's behalf. WAL journaling keeps readers
//! unblocked during a write; the design assumes a single active host process
//! per registry file. Consistency with the model library is reconciled by
//! the health sweep, not by schema constraints.

use crate::config::RegistryConfig;
use crate::error::{ModelyardError, Result};
use crate::linker::{self, LinkState, LinkStrategy};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One registered link.
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub link_id: i64,
    /// Soft reference to the model; not enforced against the index.
    pub model_id: String,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub link_type: LinkStrategy,
    pub app_id: String,
    pub app_version: Option<String>,
    /// Source and target live on different filesystems.
    pub is_external: bool,
    pub created_at: String,
}

/// Fields for registering a new link; `link_id`/`created_at` are assigned by
/// the registry.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub model_id: String,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub link_type: LinkStrategy,
    pub app_id: String,
    pub app_version: Option<String>,
    pub is_external: bool,
}

/// Why a registered link is considered broken. Exactly one reason applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenReason {
    /// Nothing exists at the target path.
    TargetMissing,
    /// A symlink exists but its resolution fails (source file missing).
    BrokenSymlink,
    /// The link object is intact but the recorded source is gone.
    SourceMissing,
}

/// A registered link classified as broken.
#[derive(Debug, Clone)]
pub struct BrokenLink {
    pub record: LinkRecord,
    pub reason: BrokenReason,
}

/// Aggregate health status, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warnings,
    Errors,
}

/// Result of a full health sweep.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub broken: Vec<BrokenLink>,
    pub orphaned: Vec<PathBuf>,
    pub external: Vec<LinkRecord>,
}

/// Outcome of a cascade delete.
#[derive(Debug, Clone, Default)]
pub struct CascadeReport {
    /// Filesystem link objects removed.
    pub files_removed: usize,
    /// Registry rows removed.
    pub rows_removed: usize,
    /// Per-link failures; the cascade continues past them.
    pub errors: Vec<(PathBuf, String)>,
}

/// SQLite link registry.
pub struct LinkRegistry {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl LinkRegistry {
    /// Create or open a registry at the given database path.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ModelyardError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(&format!(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout={};
            PRAGMA synchronous=NORMAL;
            ",
            RegistryConfig::BUSY_TIMEOUT_MS
        ))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS links (
                link_id INTEGER PRIMARY KEY,
                model_id TEXT NOT NULL,
                source_path TEXT NOT NULL,
                target_path TEXT NOT NULL UNIQUE,
                link_type TEXT NOT NULL,
                app_id TEXT NOT NULL,
                app_version TEXT,
                is_external INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_links_model ON links(model_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_links_app ON links(app_id)",
            [],
        )?;

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
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

    /// Register a link. The target path is globally unique: registering an
    /// already-registered target is a hard failure, never a silent
    /// overwrite.
    pub fn register_link(&self, spec: &LinkSpec) -> Result<i64> {
        let conn = self.lock()?;

        let result = conn.execute(
            "INSERT INTO links (model_id, source_path, target_path, link_type,
                                app_id, app_version, is_external, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                spec.model_id,
                spec.source_path.to_string_lossy(),
                spec.target_path.to_string_lossy(),
                spec.link_type.as_str(),
                spec.app_id,
                spec.app_version,
                spec.is_external as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                debug!(
                    "Registered {} link #{}: {}",
                    spec.link_type.as_str(),
                    id,
                    spec.target_path.display()
                );
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ModelyardError::DuplicateLinkTarget(
                    spec.target_path.clone(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the row for `target`, returning it if present. Does not touch
    /// the filesystem.
    pub fn unregister_link(&self, target: &Path) -> Result<Option<LinkRecord>> {
        let conn = self.lock()?;
        let target_str = target.to_string_lossy().to_string();

        let record = conn
            .query_row(
                &format!("SELECT {} FROM links WHERE target_path = ?1", COLUMNS),
                params![target_str],
                row_to_record,
            )
            .optional()?;

        if record.is_some() {
            conn.execute("DELETE FROM links WHERE target_path = ?1", params![target_str])?;
        }
        Ok(record)
    }

    /// Get the record for a target path.
    pub fn get_by_target(&self, target: &Path) -> Result<Option<LinkRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM links WHERE target_path = ?1", COLUMNS),
                params![target.to_string_lossy()],
                row_to_record,
            )
            .optional()?)
    }

    /// All links recorded for a model.
    pub fn get_links_for_model(&self, model_id: &str) -> Result<Vec<LinkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM links WHERE model_id = ?1 ORDER BY link_id",
            COLUMNS
        ))?;
        let records = collect_records(stmt.query_map(params![model_id], row_to_record)?);
        records
    }

    /// All links recorded for an application.
    pub fn get_links_for_app(&self, app_id: &str) -> Result<Vec<LinkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM links WHERE app_id = ?1 ORDER BY link_id",
            COLUMNS
        ))?;
        let records = collect_records(stmt.query_map(params![app_id], row_to_record)?);
        records
    }

    /// Every registered link.
    pub fn all_links(&self) -> Result<Vec<LinkRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM links ORDER BY link_id", COLUMNS))?;
        let records = collect_records(stmt.query_map([], row_to_record)?);
        records
    }

    /// Number of registered links.
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: usize = conn.query_row("SELECT COUNT(*) FROM links", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Cascade delete: remove every link for `model_id` from the filesystem
    /// and the registry. Run before the model itself is removed so no
    /// dangling application-visible file remains.
    ///
    /// Symlinks are removed unconditionally; hardlink/copy files only when
    /// they still exist. One failing link does not stop the cascade.
    pub fn delete_links_for_model(&self, model_id: &str) -> Result<CascadeReport> {
        let links = self.get_links_for_model(model_id)?;
        let mut report = CascadeReport::default();

        for link in links {
            let removal = match link.link_type {
                LinkStrategy::Symlink => linker::remove_link(&link.target_path, false),
                // Hardlinks and copies are real files; remove only if present
                _ => {
                    if link.target_path.exists() {
                        linker::remove_link(&link.target_path, true)
                    } else {
                        Ok(false)
                    }
                }
            };

            match removal {
                Ok(removed) => {
                    if removed {
                        report.files_removed += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        "Cascade delete could not remove {}: {}",
                        link.target_path.display(),
                        e
                    );
                    report.errors.push((link.target_path.clone(), e.to_string()));
                    continue;
                }
            }

            if self.unregister_link(&link.target_path)?.is_some() {
                report.rows_removed += 1;
            }
        }

        info!(
            "Cascade delete for {}: {} files, {} rows removed, {} errors",
            model_id,
            report.files_removed,
            report.rows_removed,
            report.errors.len()
        );
        Ok(report)
    }

    /// Classify every registered link that is no longer intact.
    pub fn find_broken_links(&self) -> Result<Vec<BrokenLink>> {
        let mut broken = Vec::new();

        for record in self.all_links()? {
            let reason = match linker::verify_link(&record.target_path) {
                LinkState::Missing => Some(BrokenReason::TargetMissing),
                LinkState::Broken => Some(BrokenReason::BrokenSymlink),
                LinkState::Valid => {
                    if record.source_path.exists() {
                        None
                    } else {
                        Some(BrokenReason::SourceMissing)
                    }
                }
            };

            if let Some(reason) = reason {
                broken.push(BrokenLink { record, reason });
            }
        }

        Ok(broken)
    }

    /// Walk an application's model tree for real symlinks the registry does
    /// not know about — drift created outside this system's bookkeeping.
    pub fn find_orphaned_links(&self, app_models_root: &Path) -> Result<Vec<PathBuf>> {
        if !app_models_root.exists() {
            return Ok(vec![]);
        }

        let mut orphans = Vec::new();
        for entry in WalkDir::new(app_models_root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.path_is_symlink() {
                continue;
            }
            if self.get_by_target(entry.path())?.is_none() {
                orphans.push(entry.path().to_path_buf());
            }
        }

        Ok(orphans)
    }

    /// Aggregate broken/orphaned/external signals into one severity.
    ///
    /// Any broken link forces `Errors`. Orphans or external links without
    /// broken ones yield `Warnings`. Otherwise `Healthy`.
    pub fn perform_health_check(&self, app_models_roots: &[PathBuf]) -> Result<HealthReport> {
        let broken = self.find_broken_links()?;

        let mut orphaned = Vec::new();
        for root in app_models_roots {
            orphaned.extend(self.find_orphaned_links(root)?);
        }

        let external: Vec<LinkRecord> = self
            .all_links()?
            .into_iter()
            .filter(|record| record.is_external)
            .collect();

        let status = if !broken.is_empty() {
            HealthStatus::Errors
        } else if !orphaned.is_empty() || !external.is_empty() {
            HealthStatus::Warnings
        } else {
            HealthStatus::Healthy
        };

        info!(
            "Link health: {:?} ({} broken, {} orphaned, {} external)",
            status,
            broken.len(),
            orphaned.len(),
            external.len()
        );

        Ok(HealthReport {
            status,
            broken,
            orphaned,
            external,
        })
    }

    /// Rewrite every recorded path under `old_prefix` to sit under
    /// `new_prefix` instead. Supports drive remounts where recorded absolute
    /// paths would otherwise go stale. Returns the number of rows updated.
    pub fn bulk_update_external_paths(
        &self,
        old_prefix: &Path,
        new_prefix: &Path,
    ) -> Result<usize> {
        let links = self.all_links()?;
        let conn = self.lock()?;

        let mut updated = 0usize;
        for link in links {
            let new_source = rebase(&link.source_path, old_prefix, new_prefix);
            let new_target = rebase(&link.target_path, old_prefix, new_prefix);

            if new_source.is_none() && new_target.is_none() {
                continue;
            }

            conn.execute(
                "UPDATE links SET source_path = ?1, target_path = ?2 WHERE link_id = ?3",
                params![
                    new_source
                        .unwrap_or(link.source_path)
                        .to_string_lossy(),
                    new_target
                        .unwrap_or(link.target_path)
                        .to_string_lossy(),
                    link.link_id,
                ],
            )?;
            updated += 1;
        }

        info!(
            "Rewrote {} link paths: {} -> {}",
            updated,
            old_prefix.display(),
            new_prefix.display()
        );
        Ok(updated)
    }
}

fn rebase(path: &Path, old_prefix: &Path, new_prefix: &Path) -> Option<PathBuf> {
    path.strip_prefix(old_prefix)
        .ok()
        .map(|rest| new_prefix.join(rest))
}

const COLUMNS: &str = "link_id, model_id, source_path, target_path, link_type, \
                       app_id, app_version, is_external, created_at";

fn row_to_record(row: &Row) -> rusqlite::Result<LinkRecord> {
    let link_type_str: String = row.get(4)?;
    let link_type = LinkStrategy::from_str(&link_type_str).unwrap_or(LinkStrategy::Symlink);

    Ok(LinkRecord {
        link_id: row.get(0)?,
        model_id: row.get(1)?,
        source_path: PathBuf::from(row.get::<_, String>(2)?),
        target_path: PathBuf::from(row.get::<_, String>(3)?),
        link_type,
        app_id: row.get(5)?,
        app_version: row.get(6)?,
        is_external: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<LinkRecord>>,
) -> Result<Vec<LinkRecord>> {
    let mut records = Vec::new();
    for row in rows {
        match row {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable link row: {}", e),
        }
    }
    Ok(records)
}
