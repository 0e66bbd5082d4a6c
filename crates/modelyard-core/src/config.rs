//! Centralized configuration constants for Modelyard Core.

/// Model library layout and persistence.
pub struct LibraryConfig;

impl LibraryConfig {
    /// Per-model metadata sidecar filename.
    pub const METADATA_FILENAME: &'static str = "metadata.json";
    /// Per-model user overrides sidecar filename.
    pub const OVERRIDES_FILENAME: &'static str = "overrides.json";
    /// SQLite index filename, stored at the library root.
    pub const INDEX_DB_FILENAME: &'static str = "index.db";
    /// Maximum length for normalized directory names.
    pub const MAX_NAME_LENGTH: usize = 128;
    /// Fallback used when normalization empties a model name.
    pub const NAME_FALLBACK: &'static str = "unnamed_model";
    /// Fallback used when normalization empties a file stem.
    pub const FILE_FALLBACK: &'static str = "file";
}

/// Streaming hasher parameters.
pub struct HashingConfig;

impl HashingConfig {
    /// Chunk size for streaming reads (8 MiB).
    pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;
}

/// Link registry persistence.
pub struct RegistryConfig;

impl RegistryConfig {
    /// SQLite database filename for the link registry.
    pub const DB_FILENAME: &'static str = "links.db";
    /// SQLite busy timeout in milliseconds.
    pub const BUSY_TIMEOUT_MS: u32 = 30_000;
}

/// Mapping configuration conventions.
pub struct MapperConfig;

impl MapperConfig {
    /// Variant name that carries no extra specificity.
    pub const DEFAULT_VARIANT: &'static str = "default";
    /// Version component matching any app version.
    pub const WILDCARD_VERSION: &'static str = "*";
    /// Specificity awarded for an exact, non-wildcard version match.
    pub const EXACT_VERSION_SCORE: i32 = 100;
    /// Specificity awarded for a non-default variant.
    pub const VARIANT_SCORE: i32 = 10;
}

/// Drive-aware I/O throttle sizing.
pub struct ThrottleConfig;

impl ThrottleConfig {
    /// Concurrent heavy operations against a spinning disk.
    pub const HDD_PERMITS: usize = 1;
    /// Concurrent heavy operations against a solid-state drive.
    pub const SSD_PERMITS: usize = 4;
    /// Concurrent heavy operations when the drive type is unknown.
    pub const UNKNOWN_PERMITS: usize = 2;
}
