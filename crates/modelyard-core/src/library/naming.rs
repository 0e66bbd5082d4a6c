//! Filesystem-safe name and path generation.
//!
//! Everything the library writes under an application-visible directory goes
//! through these helpers, so a name is never more exotic than `[A-Za-z0-9_-]`
//! plus a file extension.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Regex for characters outside the allowed set.
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

/// Regex for consecutive underscores/hyphens.
static CONSECUTIVE_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_]{2,}").unwrap());

/// Normalize a value into a filesystem-safe name.
///
/// Spaces become underscores so word boundaries survive; every other
/// character outside `[A-Za-z0-9_-]` is stripped, separator runs collapse,
/// and leading/trailing separators are trimmed. The result is truncated to
/// `max_length` (breaking at a separator when one sits past the midpoint)
/// and replaced by `fallback` when empty.
///
/// Normalizing an already-normalized value returns it unchanged.
///
/// # Examples
///
/// ```
/// use modelyard_core::library::normalize_name;
///
/// assert_eq!(normalize_name("Llama 2 7B", 128, "unnamed"), "Llama_2_7B");
/// assert_eq!(normalize_name("model/test:file", 128, "unnamed"), "modeltestfile");
/// assert_eq!(normalize_name("///", 128, "unnamed"), "unnamed");
/// ```
pub fn normalize_name(value: &str, max_length: usize, fallback: &str) -> String {
    let mut result = value.replace(' ', "_");

    result = DISALLOWED.replace_all(&result, "").to_string();
    result = CONSECUTIVE_SEPARATORS.replace_all(&result, "_").to_string();
    result = result.trim_matches(|c| c == '-' || c == '_').to_string();

    if result.len() > max_length {
        result.truncate(max_length);
        // Prefer breaking at a separator past the midpoint
        if let Some(pos) = result.rfind(|c| c == '-' || c == '_') {
            if pos > max_length / 2 {
                result.truncate(pos);
            }
        }
        result = result.trim_matches(|c| c == '-' || c == '_').to_string();
    }

    if result.is_empty() {
        result = fallback.to_string();
    }

    result
}

/// Normalize a filename while preserving its extension.
///
/// The stem is normalized independently and its length budget is
/// `max_length` minus the extension length, so the whole filename fits the
/// budget.
///
/// # Examples
///
/// ```
/// use modelyard_core::library::normalize_filename;
///
/// assert_eq!(normalize_filename("My Model.safetensors", 128), "My_Model.safetensors");
/// assert_eq!(normalize_filename("weights.safetensors", 128), "weights.safetensors");
/// ```
pub fn normalize_filename(name: &str, max_length: usize) -> String {
    match name.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => {
            let stem = &name[..dot_pos];
            let ext = &name[dot_pos..];
            let budget = max_length.saturating_sub(ext.len()).max(1);
            format!(
                "{}{}",
                normalize_name(stem, budget, crate::config::LibraryConfig::FILE_FALLBACK),
                ext
            )
        }
        _ => normalize_name(
            name,
            max_length,
            crate::config::LibraryConfig::FILE_FALLBACK,
        ),
    }
}

/// Return `base` if it does not exist, otherwise the first free
/// `stem-2{ext}`, `stem-3{ext}`, … sibling.
///
/// Performs only existence checks; there is no reservation, so two callers
/// probing concurrently can race (single active process assumed).
pub fn unique_path(base: &Path) -> PathBuf {
    if !base.exists() {
        return base.to_path_buf();
    }

    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = base
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    let mut counter = 2u32;
    loop {
        let candidate = base.with_file_name(format!("{}-{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
