//! The mapping engine: decides which library files get linked where, and
//! performs or previews those decisions.
//!
//! `preview_mapping` and `apply_for_app` run the same planning function;
//! apply executes the resulting actions, preview only reports them, so the
//! two can never diverge.

use crate::config::LibraryConfig;
use crate::error::{ModelyardError, Result};
use crate::index::IndexEntry;
use crate::library::naming::normalize_filename;
use crate::library::types::ModelOverrides;
use crate::library::ModelLibrary;
use crate::linker::{self, LinkStrategy};
use crate::mapper::config::{load_merged_rules, MappingRule, RuleFilters};
use crate::platform::detect_sandbox_environment;
use crate::registry::LinkSpec;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What the engine decided for one candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingActionType {
    /// Create a new link (possibly replacing a stale symlink).
    Create,
    /// Link already in place and resolving to the right source.
    SkipExists,
    /// Another model/rule already claimed the target this run.
    SkipConflict,
    /// Pre-existing broken symlink to clean up.
    RemoveBroken,
}

/// One planned or previewed action.
#[derive(Debug, Clone)]
pub struct MappingAction {
    pub action: MappingActionType,
    pub model_id: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub strategy: LinkStrategy,
    /// A stale symlink occupies the target and will be replaced.
    pub replace_existing: bool,
    pub reason: Option<String>,
}

/// Side-effect-free mapping preview.
#[derive(Debug, Clone, Default)]
pub struct MappingPreview {
    pub to_create: Vec<MappingAction>,
    pub to_skip_exists: Vec<MappingAction>,
    pub to_skip_conflict: Vec<MappingAction>,
    pub to_remove_broken: Vec<MappingAction>,
    /// Environmental caveats: cross-filesystem placement, sandboxing.
    pub warnings: Vec<String>,
}

/// Counts reported after a mutating mapping pass. Partial success is the
/// norm: errors carry per-target detail while the rest of the batch
/// proceeds.
#[derive(Debug, Clone, Default)]
pub struct MappingReport {
    pub created: usize,
    pub skipped_exists: usize,
    pub conflicts: usize,
    pub broken_removed: usize,
    pub errors: Vec<(PathBuf, String)>,
}

/// The rule engine projecting library models into application directories.
pub struct ModelMapper {
    library: Arc<ModelLibrary>,
    config_dir: PathBuf,
}

impl ModelMapper {
    pub fn new(library: Arc<ModelLibrary>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            library,
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    // ========================================
    // Public operations
    // ========================================

    /// Compute every action a mapping pass would take, with zero side
    /// effects.
    pub fn preview_mapping(
        &self,
        app_id: &str,
        app_version: &str,
        app_models_root: &Path,
    ) -> Result<MappingPreview> {
        self.plan(app_id, app_version, app_models_root, None)
    }

    /// Perform the mapping: remove broken symlinks, create missing links,
    /// register each created link. One failing action never aborts the
    /// batch.
    pub fn apply_for_app(
        &self,
        app_id: &str,
        app_version: &str,
        app_models_root: &Path,
    ) -> Result<MappingReport> {
        let plan = self.plan(app_id, app_version, app_models_root, None)?;
        Ok(self.execute(plan, app_id, app_version))
    }

    /// Like [`Self::apply_for_app`], restricted to the given model IDs.
    /// Fast path after small library additions.
    pub fn sync_models_incrementally(
        &self,
        app_id: &str,
        app_version: &str,
        app_models_root: &Path,
        model_ids: &[String],
    ) -> Result<MappingReport> {
        let only: HashSet<String> = model_ids.iter().cloned().collect();
        let plan = self.plan(app_id, app_version, app_models_root, Some(&only))?;
        Ok(self.execute(plan, app_id, app_version))
    }

    // ========================================
    // Planning
    // ========================================

    fn plan(
        &self,
        app_id: &str,
        app_version: &str,
        app_models_root: &Path,
        only: Option<&HashSet<String>>,
    ) -> Result<MappingPreview> {
        let merged = load_merged_rules(&self.config_dir, app_id, app_version)?.ok_or_else(|| {
            ModelyardError::ConfigNotFound {
                app_id: app_id.to_string(),
                version: Some(app_version.to_string()),
            }
        })?;
        debug!(
            "Planning {} {} from {:?}",
            app_id, app_version, merged.sources
        );

        let models = self.library.list_models()?;
        let mut preview = MappingPreview::default();
        self.collect_warnings(app_models_root, &mut preview.warnings);

        // target -> source already claimed in this run
        let mut claimed: HashMap<PathBuf, PathBuf> = HashMap::new();
        // model_id -> overrides, loaded once per model
        let mut overrides_cache: HashMap<String, Option<ModelOverrides>> = HashMap::new();
        let mut rule_dirs: Vec<PathBuf> = Vec::new();

        for rule in &merged.rules {
            let globs = match compile_patterns(&rule.patterns) {
                Ok(globs) => globs,
                Err(e) => {
                    warn!(
                        "Skipping rule for {:?}: invalid pattern ({})",
                        rule.target_subdir, e
                    );
                    continue;
                }
            };

            let rule_dir = app_models_root.join(&rule.target_subdir);
            if !rule_dirs.contains(&rule_dir) {
                rule_dirs.push(rule_dir.clone());
            }
            let strategy = rule.method.unwrap_or_else(linker::default_strategy);

            for model in &models {
                if let Some(only) = only {
                    if !only.contains(&model.model_id) {
                        continue;
                    }
                }

                // Version gate comes first; a gated model never reaches the
                // filters
                let allowed = overrides_cache
                    .entry(model.model_id.clone())
                    .or_insert_with(|| {
                        self.library
                            .load_overrides(&self.library.model_dir(&model.model_id))
                            .unwrap_or_else(|e| {
                                warn!("Unreadable overrides for {}: {}", model.model_id, e);
                                None
                            })
                    })
                    .as_ref()
                    .map(|o| o.allows(app_id, app_version))
                    .unwrap_or(true);
                if !allowed {
                    debug!(
                        "Model {} gated out for {} {}",
                        model.model_id, app_id, app_version
                    );
                    continue;
                }

                if !matches_filters(model, &rule.filters) {
                    continue;
                }

                let model_dir = self.library.model_dir(&model.model_id);
                let files = match self.library.model_files(&model_dir) {
                    Ok(files) => files,
                    Err(e) => {
                        warn!("Cannot list files of {}: {}", model.model_id, e);
                        continue;
                    }
                };

                for file in files {
                    let Some(filename) = file.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !globs.is_match(filename) {
                        continue;
                    }

                    let target = rule_dir
                        .join(normalize_filename(filename, LibraryConfig::MAX_NAME_LENGTH));
                    let action = self.resolve_candidate(
                        &model.model_id,
                        &file,
                        target,
                        strategy,
                        &mut claimed,
                    );
                    match action.action {
                        MappingActionType::Create => preview.to_create.push(action),
                        MappingActionType::SkipExists => preview.to_skip_exists.push(action),
                        MappingActionType::SkipConflict => preview.to_skip_conflict.push(action),
                        MappingActionType::RemoveBroken => unreachable!(),
                    }
                }
            }
        }

        // Surface pre-existing broken symlinks in the rule directories that
        // no candidate is about to replace
        for dir in rule_dirs {
            for broken in find_broken_symlinks(&dir) {
                if claimed.contains_key(&broken) {
                    continue;
                }
                preview.to_remove_broken.push(MappingAction {
                    action: MappingActionType::RemoveBroken,
                    model_id: String::new(),
                    source: PathBuf::new(),
                    target: broken,
                    strategy: LinkStrategy::Symlink,
                    replace_existing: false,
                    reason: Some("broken symlink".to_string()),
                });
            }
        }

        Ok(preview)
    }

    /// Decide the outcome for one `(source, target)` candidate.
    ///
    /// Walks `-2/-3…` suffixes when real files occupy the target, so a
    /// previously renamed link is found again on the next pass instead of
    /// renaming once more.
    fn resolve_candidate(
        &self,
        model_id: &str,
        source: &Path,
        target: PathBuf,
        strategy: LinkStrategy,
        claimed: &mut HashMap<PathBuf, PathBuf>,
    ) -> MappingAction {
        let mk = |action, target: PathBuf, replace, reason: Option<&str>| MappingAction {
            action,
            model_id: model_id.to_string(),
            source: source.to_path_buf(),
            target,
            strategy,
            replace_existing: replace,
            reason: reason.map(String::from),
        };

        let base = target.clone();
        let mut suffix = 2u32;
        let mut candidate = target;
        loop {
            if let Some(existing_source) = claimed.get(&candidate) {
                if existing_source.as_path() == source {
                    // Another rule already plans this exact link; fold into it
                    return mk(
                        MappingActionType::SkipExists,
                        candidate,
                        false,
                        Some("already planned by an earlier rule"),
                    );
                }
                return mk(
                    MappingActionType::SkipConflict,
                    candidate,
                    false,
                    Some("target claimed by another model in this run"),
                );
            }

            let Ok(meta) = candidate.symlink_metadata() else {
                claimed.insert(candidate.clone(), source.to_path_buf());
                return mk(MappingActionType::Create, candidate, false, None);
            };

            if meta.file_type().is_symlink() {
                let resolves_to_source = std::fs::canonicalize(&candidate)
                    .ok()
                    .zip(std::fs::canonicalize(source).ok())
                    .map(|(a, b)| a == b)
                    .unwrap_or(false);

                if resolves_to_source {
                    claimed.insert(candidate.clone(), source.to_path_buf());
                    return mk(
                        MappingActionType::SkipExists,
                        candidate,
                        false,
                        Some("link already in place"),
                    );
                }

                // Wrong-source or broken symlink: ours to replace
                claimed.insert(candidate.clone(), source.to_path_buf());
                return mk(
                    MappingActionType::Create,
                    candidate,
                    true,
                    Some("replacing stale symlink"),
                );
            }

            // A real file. If our own bookkeeping created it (hardlink/copy
            // strategies), it is already the link we want.
            let registered_here = self
                .library
                .link_registry()
                .get_by_target(&candidate)
                .ok()
                .flatten()
                .map(|record| record.source_path.as_path() == source)
                .unwrap_or(false);
            if registered_here {
                claimed.insert(candidate.clone(), source.to_path_buf());
                return mk(
                    MappingActionType::SkipExists,
                    candidate,
                    false,
                    Some("registered link already in place"),
                );
            }

            // Preserve the user's file and step to the next suffixed name.
            // Each suffix is re-evaluated in full, so a link renamed on an
            // earlier pass is recognized instead of renamed again.
            let next = suffixed_sibling(&base, suffix);
            suffix += 1;
            debug!(
                "Real file at {}, probing {}",
                candidate.display(),
                next.display()
            );
            candidate = next;
        }
    }

    fn collect_warnings(&self, app_models_root: &Path, warnings: &mut Vec<String>) {
        if linker::is_cross_filesystem(self.library.library_root(), app_models_root) {
            warnings.push(format!(
                "Application root {} is on a different filesystem than the library; \
                 links will be recorded as external",
                app_models_root.display()
            ));
        }

        let sandbox = detect_sandbox_environment();
        if sandbox.is_sandboxed {
            warnings.push(format!(
                "Running inside a {} sandbox: {}",
                sandbox.kind.as_str(),
                sandbox.limitations.join("; ")
            ));
        }
    }

    // ========================================
    // Execution
    // ========================================

    fn execute(&self, plan: MappingPreview, app_id: &str, app_version: &str) -> MappingReport {
        let registry = self.library.link_registry();
        let throttle = self.library.io_throttle();

        let mut report = MappingReport {
            skipped_exists: plan.to_skip_exists.len(),
            conflicts: plan.to_skip_conflict.len(),
            ..Default::default()
        };

        for action in &plan.to_remove_broken {
            match linker::remove_link(&action.target, false) {
                Ok(true) => {
                    // Stale bookkeeping for the removed link goes with it
                    let _ = registry.unregister_link(&action.target);
                    report.broken_removed += 1;
                }
                Ok(false) => {}
                Err(e) => report.errors.push((action.target.clone(), e.to_string())),
            }
        }

        for action in plan.to_create {
            if let Err(e) =
                self.create_one(&action, app_id, app_version, throttle.as_ref(), registry.as_ref())
            {
                warn!("Mapping action failed for {}: {}", action.target.display(), e);
                report.errors.push((action.target, e.to_string()));
            } else {
                report.created += 1;
            }
        }

        info!(
            "Mapping {} {}: {} created, {} existing, {} conflicts, {} broken removed, {} errors",
            app_id,
            app_version,
            report.created,
            report.skipped_exists,
            report.conflicts,
            report.broken_removed,
            report.errors.len()
        );
        report
    }

    fn create_one(
        &self,
        action: &MappingAction,
        app_id: &str,
        app_version: &str,
        throttle: &crate::io::IoThrottle,
        registry: &crate::registry::LinkRegistry,
    ) -> Result<()> {
        if action.replace_existing {
            linker::remove_link(&action.target, false)?;
            // The replaced link may carry a registry row pointing elsewhere
            let _ = registry.unregister_link(&action.target)?;
        }

        // Copies and clones move real bytes; serialize them per drive
        let _permit = match action.strategy {
            LinkStrategy::Copy | LinkStrategy::Reflink => Some(throttle.acquire(&action.target)),
            _ => None,
        };

        let used = linker::create_link(
            &action.source,
            &action.target,
            action.strategy,
            false,
            false,
        )?;

        let spec = LinkSpec {
            model_id: action.model_id.clone(),
            source_path: action.source.clone(),
            target_path: action.target.clone(),
            link_type: used,
            app_id: app_id.to_string(),
            app_version: Some(app_version.to_string()),
            is_external: linker::is_cross_filesystem(&action.source, &action.target),
        };

        if let Err(e) = registry.register_link(&spec) {
            // Keep filesystem and bookkeeping consistent: an unregistered
            // link would surface as an orphan forever
            let _ = linker::remove_link(&action.target, true);
            return Err(e);
        }

        Ok(())
    }
}

/// AND across filter keys, OR within each key's values, exclusion last.
fn matches_filters(model: &IndexEntry, filters: &RuleFilters) -> bool {
    let eq_any = |values: &[String], field: &str| {
        values.iter().any(|v| v.eq_ignore_ascii_case(field))
    };

    if !filters.model_type.is_empty() && !eq_any(&filters.model_type, &model.model_type) {
        return false;
    }
    if !filters.subtype.is_empty() && !eq_any(&filters.subtype, &model.subtype) {
        return false;
    }
    if !filters.families.is_empty() && !eq_any(&filters.families, &model.family) {
        return false;
    }

    if !filters.tags.is_empty() {
        let any_tag = model
            .tags
            .iter()
            .any(|tag| eq_any(&filters.tags, tag));
        if !any_tag {
            return false;
        }
    }

    // Evaluated after inclusion: exclusion always wins
    if model
        .tags
        .iter()
        .any(|tag| eq_any(&filters.exclude_tags, tag))
    {
        return false;
    }

    true
}

/// The `stem-{n}{.ext}` sibling of `base`, matching the library's
/// unique-path suffix scheme.
fn suffixed_sibling(base: &Path, n: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = base
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    base.with_file_name(format!("{}-{}{}", stem, n, ext))
}

/// Empty pattern lists match everything.
fn compile_patterns(patterns: &[String]) -> std::result::Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    if patterns.is_empty() {
        builder.add(Glob::new("*")?);
    } else {
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
    }
    builder.build()
}

/// Broken symlinks directly under `dir`.
fn find_broken_symlinks(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return vec![];
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path_is_symlink())
        .filter(|e| std::fs::canonicalize(e.path()).is_err())
        .map(|e| e.path().to_path_buf())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::types::ModelHashes;

    fn entry(model_type: &str, subtype: &str, family: &str, tags: &[&str]) -> IndexEntry {
        IndexEntry {
            model_id: "test/model".to_string(),
            cleaned_name: "model".to_string(),
            official_name: "Model".to_string(),
            model_type: model_type.to_string(),
            subtype: subtype.to_string(),
            family: family.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            hashes: ModelHashes::default(),
            size_bytes: 0,
            metadata: Default::default(),
            updated_at: String::new(),
        }
    }

    fn filters(
        model_type: &[&str],
        tags: &[&str],
        exclude_tags: &[&str],
    ) -> RuleFilters {
        RuleFilters {
            model_type: model_type.iter().map(|s| s.to_string()).collect(),
            subtype: vec![],
            families: vec![],
            tags: tags.iter().map(|s| s.to_string()).collect(),
            exclude_tags: exclude_tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_filter_and_across_keys() {
        let model = entry("diffusion", "checkpoints", "sdxl", &[]);

        let mut f = filters(&["diffusion"], &[], &[]);
        f.families = vec!["sdxl".to_string()];
        assert!(matches_filters(&model, &f));

        f.families = vec!["flux".to_string()];
        assert!(!matches_filters(&model, &f));
    }

    #[test]
    fn test_filter_or_within_key() {
        let model = entry("diffusion", "", "", &[]);
        let f = filters(&["llm", "diffusion"], &[], &[]);
        assert!(matches_filters(&model, &f));
    }

    #[test]
    fn test_filter_tags_or() {
        let tagged = entry("diffusion", "", "", &["anime"]);
        let untagged = entry("diffusion", "", "", &[]);
        let f = filters(&[], &["anime", "realistic"], &[]);

        assert!(matches_filters(&tagged, &f));
        assert!(!matches_filters(&untagged, &f));
    }

    #[test]
    fn test_exclusion_wins_over_inclusion() {
        // {sdxl, base} matches tags:[sdxl] but exclude_tags:[base] removes it
        let model = entry("diffusion", "", "", &["sdxl", "base"]);

        assert!(matches_filters(&model, &filters(&[], &["sdxl"], &[])));
        assert!(!matches_filters(&model, &filters(&[], &["sdxl"], &["base"])));
    }

    #[test]
    fn test_filter_case_insensitive() {
        let model = entry("Diffusion", "", "", &["SDXL"]);
        assert!(matches_filters(&model, &filters(&["diffusion"], &["sdxl"], &[])));
    }

    #[test]
    fn test_empty_filters_match_all() {
        let model = entry("llm", "", "", &[]);
        assert!(matches_filters(&model, &RuleFilters::default()));
    }

    #[test]
    fn test_compile_patterns() {
        let globs = compile_patterns(&["*.safetensors".to_string()]).unwrap();
        assert!(globs.is_match("weights.safetensors"));
        assert!(!globs.is_match("weights.gguf"));

        let all = compile_patterns(&[]).unwrap();
        assert!(all.is_match("anything.bin"));

        assert!(compile_patterns(&["[".to_string()]).is_err());
    }
}
