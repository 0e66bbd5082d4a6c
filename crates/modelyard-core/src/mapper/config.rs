//! Mapping configuration files and their merge rules.
//!
//! Config files live in one directory and are named
//! `{app}_{version|"*"}_{variant}.json`. When several files match an
//! `(app_id, app_version)` pair they merge deterministically: files sort by
//! specificity (exact version beats wildcard, non-default variant beats
//! default), rule lists concatenate in that order, and the merged list is
//! re-sorted by each rule's explicit `priority` — so authors control final
//! ordering independent of which file a rule came from.

use crate::config::MapperConfig;
use crate::error::Result;
use crate::linker::LinkStrategy;
use crate::metadata::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Filters a rule applies to candidate models.
///
/// Keys combine with AND; the values within one key OR-match. `tags`
/// OR-matches, and `exclude_tags` is evaluated strictly after inclusion, so
/// exclusion always wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuleFilters {
    #[serde(default)]
    pub model_type: Vec<String>,
    #[serde(default)]
    pub subtype: Vec<String>,
    #[serde(default)]
    pub families: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

/// One mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MappingRule {
    /// Directory under the app's models root links are placed in.
    pub target_subdir: String,
    /// Glob patterns over model filenames; empty matches every file.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub filters: RuleFilters,
    /// Link strategy override; platform default when absent.
    #[serde(default)]
    pub method: Option<LinkStrategy>,
    /// Ascending evaluation order across all merged configs.
    #[serde(default)]
    pub priority: i64,
}

/// One configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MappingConfig {
    pub app: String,
    /// Exact version or `"*"`.
    pub version: String,
    #[serde(default)]
    pub variant: Option<String>,
    pub rules: Vec<MappingRule>,
}

impl MappingConfig {
    /// The conventional filename for this config.
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}.json",
            self.app,
            self.version,
            self.variant
                .as_deref()
                .unwrap_or(MapperConfig::DEFAULT_VARIANT)
        )
    }
}

/// Rules merged from every matching config file, in final evaluation order.
#[derive(Debug, Clone, Default)]
pub struct MergedRules {
    pub rules: Vec<MappingRule>,
    /// Filenames that contributed, most specific first.
    pub sources: Vec<String>,
}

/// Parsed name components of a config file.
struct ConfigName<'a> {
    app: &'a str,
    version: &'a str,
    variant: &'a str,
}

/// Parse `{app}_{version}_{variant}` from a file stem. The app id may itself
/// contain underscores, so version and variant split off the right.
fn parse_config_name(stem: &str) -> Option<ConfigName<'_>> {
    let (rest, variant) = stem.rsplit_once('_')?;
    let (app, version) = rest.rsplit_once('_')?;
    if app.is_empty() || version.is_empty() || variant.is_empty() {
        return None;
    }
    Some(ConfigName {
        app,
        version,
        variant,
    })
}

/// Specificity score for config precedence.
fn specificity(version: &str, variant: &str, requested_version: &str) -> i32 {
    let mut score = 0;
    if version != MapperConfig::WILDCARD_VERSION && version == requested_version {
        score += MapperConfig::EXACT_VERSION_SCORE;
    }
    if variant != MapperConfig::DEFAULT_VARIANT {
        score += MapperConfig::VARIANT_SCORE;
    }
    score
}

/// Load and merge every config matching `(app_id, app_version)`.
///
/// Malformed files are skipped with a diagnostic rather than failing the
/// whole load. Returns `None` when no file matches at all.
pub fn load_merged_rules(
    config_dir: &Path,
    app_id: &str,
    app_version: &str,
) -> Result<Option<MergedRules>> {
    if !config_dir.exists() {
        return Ok(None);
    }

    let mut matched: Vec<(i32, String, MappingConfig)> = Vec::new();

    for entry in std::fs::read_dir(config_dir)
        .map_err(|e| crate::error::ModelyardError::io_with_path(e, config_dir))?
    {
        let Ok(entry) = entry else { continue };
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(name) = parse_config_name(stem) else {
            debug!("Ignoring config with unconventional name: {}", stem);
            continue;
        };

        if name.app != app_id {
            continue;
        }
        if name.version != MapperConfig::WILDCARD_VERSION && name.version != app_version {
            continue;
        }

        let config: MappingConfig = match atomic_read_json(&path) {
            Ok(Some(config)) => config,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping malformed mapping config {}: {}", path.display(), e);
                continue;
            }
        };

        let score = specificity(name.version, name.variant, app_version);
        matched.push((score, format!("{}.json", stem), config));
    }

    if matched.is_empty() {
        return Ok(None);
    }

    // Most specific first; filename tiebreak keeps the order deterministic
    matched.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut merged = MergedRules::default();
    for (_, filename, config) in matched {
        merged.sources.push(filename);
        merged.rules.extend(config.rules);
    }

    // Global author-controlled ordering; stable so provenance breaks ties
    merged.rules.sort_by_key(|rule| rule.priority);

    Ok(Some(merged))
}

/// Persist a config under its conventional filename.
pub fn save_config(config_dir: &Path, config: &MappingConfig) -> Result<()> {
    std::fs::create_dir_all(config_dir)
        .map_err(|e| crate::error::ModelyardError::io_with_path(e, config_dir))?;
    crate::metadata::atomic_write_json(&config_dir.join(config.filename()), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rule(target: &str, priority: i64) -> MappingRule {
        MappingRule {
            target_subdir: target.to_string(),
            patterns: vec![],
            filters: RuleFilters::default(),
            method: None,
            priority,
        }
    }

    fn write_config(dir: &Path, app: &str, version: &str, variant: &str, rules: Vec<MappingRule>) {
        let config = MappingConfig {
            app: app.to_string(),
            version: version.to_string(),
            variant: Some(variant.to_string()),
            rules,
        };
        save_config(dir, &config).unwrap();
    }

    #[test]
    fn test_parse_config_name() {
        let name = parse_config_name("comfyui_0.6.0_default").unwrap();
        assert_eq!(name.app, "comfyui");
        assert_eq!(name.version, "0.6.0");
        assert_eq!(name.variant, "default");

        // App ids may contain underscores
        let name = parse_config_name("open_webui_*_custom").unwrap();
        assert_eq!(name.app, "open_webui");
        assert_eq!(name.version, "*");
        assert_eq!(name.variant, "custom");

        assert!(parse_config_name("justone").is_none());
        assert!(parse_config_name("two_parts").is_none());
    }

    #[test]
    fn test_no_config_dir_is_none() {
        let temp = TempDir::new().unwrap();
        let merged = load_merged_rules(&temp.path().join("missing"), "comfyui", "0.6.0").unwrap();
        assert!(merged.is_none());
    }

    #[test]
    fn test_version_filtering() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "comfyui", "0.6.0", "default", vec![rule("a", 0)]);
        write_config(temp.path(), "comfyui", "0.7.0", "default", vec![rule("b", 0)]);
        write_config(temp.path(), "comfyui", "*", "default", vec![rule("c", 0)]);
        write_config(temp.path(), "invokeai", "0.6.0", "default", vec![rule("d", 0)]);

        let merged = load_merged_rules(temp.path(), "comfyui", "0.6.0")
            .unwrap()
            .unwrap();
        let targets: Vec<_> = merged.rules.iter().map(|r| r.target_subdir.as_str()).collect();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&"a"));
        assert!(targets.contains(&"c"));
        assert!(!targets.contains(&"b"));
        assert!(!targets.contains(&"d"));
    }

    #[test]
    fn test_specificity_ordering() {
        let temp = TempDir::new().unwrap();
        // Same priority everywhere: file specificity decides concat order
        write_config(temp.path(), "comfyui", "*", "default", vec![rule("wild", 0)]);
        write_config(temp.path(), "comfyui", "0.6.0", "default", vec![rule("exact", 0)]);
        write_config(temp.path(), "comfyui", "*", "custom", vec![rule("variant", 0)]);

        let merged = load_merged_rules(temp.path(), "comfyui", "0.6.0")
            .unwrap()
            .unwrap();
        let targets: Vec<_> = merged.rules.iter().map(|r| r.target_subdir.as_str()).collect();
        // exact (+100) > custom variant (+10) > wildcard default (0)
        assert_eq!(targets, vec!["exact", "variant", "wild"]);
        assert_eq!(
            merged.sources,
            vec![
                "comfyui_0.6.0_default.json",
                "comfyui_*_custom.json",
                "comfyui_*_default.json"
            ]
        );
    }

    #[test]
    fn test_priority_overrides_provenance() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "comfyui", "0.6.0", "default", vec![rule("late", 50)]);
        write_config(temp.path(), "comfyui", "*", "default", vec![rule("early", 1)]);

        let merged = load_merged_rules(temp.path(), "comfyui", "0.6.0")
            .unwrap()
            .unwrap();
        let targets: Vec<_> = merged.rules.iter().map(|r| r.target_subdir.as_str()).collect();
        // Numeric priority wins over file specificity
        assert_eq!(targets, vec!["early", "late"]);
    }

    #[test]
    fn test_malformed_config_is_skipped() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "comfyui", "0.6.0", "default", vec![rule("good", 0)]);
        std::fs::write(temp.path().join("comfyui_*_custom.json"), "{broken").unwrap();

        let merged = load_merged_rules(temp.path(), "comfyui", "0.6.0")
            .unwrap()
            .unwrap();
        assert_eq!(merged.rules.len(), 1);
        assert_eq!(merged.rules[0].target_subdir, "good");
    }

    #[test]
    fn test_rule_defaults() {
        let json = r#"{
            "app": "comfyui",
            "version": "*",
            "rules": [{"target_subdir": "checkpoints"}]
        }"#;
        let config: MappingConfig = serde_json::from_str(json).unwrap();
        let rule = &config.rules[0];
        assert!(rule.patterns.is_empty());
        assert!(rule.filters.tags.is_empty());
        assert!(rule.method.is_none());
        assert_eq!(rule.priority, 0);
    }
}
