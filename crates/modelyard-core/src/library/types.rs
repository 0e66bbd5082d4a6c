//! Model library data structures.
//!
//! `metadata.json` is the source of truth for a model; the SQLite index is a
//! derived cache rebuilt from these files. Every optional field defaults so
//! older sidecar files keep parsing as the schema grows.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Content hashes for a model's primary file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ModelHashes {
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub blake3: Option<String>,
}

/// One file belonging to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ModelFileInfo {
    /// Filename inside the model directory.
    pub name: String,
    /// Name the file had before import normalization.
    #[serde(default)]
    pub original_name: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Per-model metadata sidecar (`metadata.json`).
///
/// `model_id` is the directory path relative to the library root and never
/// changes after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelMetadata {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub official_name: Option<String>,
    #[serde(default)]
    pub cleaned_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub preview_image: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub model_card: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub inference_settings: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub compatible_apps: Vec<String>,
    #[serde(default)]
    pub hashes: Option<ModelHashes>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub added_date: Option<String>,
    #[serde(default)]
    pub updated_date: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub files: Vec<ModelFileInfo>,
}

impl ModelMetadata {
    /// Best display name: official name, then cleaned name, then the id.
    pub fn display_name(&self) -> &str {
        self.official_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.cleaned_name.as_deref())
            .or(self.model_id.as_deref())
            .unwrap_or("unnamed")
    }
}

/// Per-model user overrides sidecar (`overrides.json`).
///
/// An absent entry means "no constraint": the model is always eligible for
/// that application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelOverrides {
    /// app_id -> semver requirement string (e.g. `">=0.5, <1.0"`).
    #[serde(default)]
    pub version_ranges: HashMap<String, String>,
}

impl ModelOverrides {
    /// Whether this model is eligible for `app_id` at `app_version`.
    ///
    /// Missing constraint means eligible. An unparsable requirement or app
    /// version logs a warning and gates the model out rather than linking it
    /// under a constraint nobody can evaluate.
    pub fn allows(&self, app_id: &str, app_version: &str) -> bool {
        let Some(range) = self.version_ranges.get(app_id) else {
            return true;
        };

        let req = match VersionReq::parse(range) {
            Ok(req) => req,
            Err(e) => {
                warn!(
                    "Unparsable version range {:?} for app {}: {}",
                    range, app_id, e
                );
                return false;
            }
        };

        match parse_lenient_version(app_version) {
            Some(version) => req.matches(&version),
            None => {
                warn!("Unparsable app version {:?} for app {}", app_version, app_id);
                false
            }
        }
    }
}

/// Parse a version that may be missing minor/patch components ("0.6" -> 0.6.0).
pub(crate) fn parse_lenient_version(value: &str) -> Option<Version> {
    let value = value.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(value) {
        return Some(v);
    }
    let dots = value.chars().filter(|&c| c == '.').count();
    let padded = match dots {
        0 => format!("{}.0.0", value),
        1 => format!("{}.0", value),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults_tolerate_sparse_json() {
        let meta: ModelMetadata = serde_json::from_str(r#"{"family": "sdxl"}"#).unwrap();
        assert_eq!(meta.family.as_deref(), Some("sdxl"));
        assert!(meta.tags.is_empty());
        assert!(meta.hashes.is_none());
    }

    #[test]
    fn test_display_name_preference() {
        let mut meta = ModelMetadata {
            model_id: Some("diffusion/sdxl/base".into()),
            cleaned_name: Some("sdxl_base".into()),
            ..Default::default()
        };
        assert_eq!(meta.display_name(), "sdxl_base");

        meta.official_name = Some("SDXL Base 1.0".into());
        assert_eq!(meta.display_name(), "SDXL Base 1.0");
    }

    #[test]
    fn test_overrides_absent_is_unconstrained() {
        let overrides = ModelOverrides::default();
        assert!(overrides.allows("comfyui", "0.6.0"));
    }

    #[test]
    fn test_overrides_gate() {
        let mut overrides = ModelOverrides::default();
        overrides
            .version_ranges
            .insert("comfyui".into(), ">=0.5, <1.0".into());

        assert!(overrides.allows("comfyui", "0.6.0"));
        assert!(!overrides.allows("comfyui", "1.2.0"));
        // Other apps remain unconstrained
        assert!(overrides.allows("invokeai", "99.0.0"));
    }

    #[test]
    fn test_overrides_bad_range_gates_out() {
        let mut overrides = ModelOverrides::default();
        overrides
            .version_ranges
            .insert("comfyui".into(), "not a range".into());

        assert!(!overrides.allows("comfyui", "0.6.0"));
    }

    #[test]
    fn test_lenient_version_parsing() {
        assert_eq!(parse_lenient_version("0.6.0"), Version::parse("0.6.0").ok());
        assert_eq!(parse_lenient_version("0.6"), Version::parse("0.6.0").ok());
        assert_eq!(parse_lenient_version("2"), Version::parse("2.0.0").ok());
        assert_eq!(parse_lenient_version("v1.2.3"), Version::parse("1.2.3").ok());
        assert!(parse_lenient_version("garbage").is_none());
    }
}
