//! Canonical model storage: directory layout, metadata sidecars, hashing,
//! and naming.

pub mod hashing;
mod library;
pub mod naming;
pub mod types;

pub use hashing::{available_algorithms, compute_dual_hash, verify_sha256, DualHash, HashAlgorithm};
pub use library::{DeepVerifyReport, LibraryStats, ModelLibrary};
pub use naming::{normalize_filename, normalize_name, unique_path};
pub use types::{ModelFileInfo, ModelHashes, ModelMetadata, ModelOverrides};

use crate::config::LibraryConfig;

/// Whether a filename is one of the library's own sidecar/backup files and
/// must never be linked into an application directory.
pub fn is_sidecar_file(name: &str) -> bool {
    name == LibraryConfig::METADATA_FILENAME
        || name == LibraryConfig::OVERRIDES_FILENAME
        || name.ends_with(".bak")
        || name.ends_with(".tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_detection() {
        assert!(is_sidecar_file("metadata.json"));
        assert!(is_sidecar_file("overrides.json"));
        assert!(is_sidecar_file("metadata.json.bak"));
        assert!(is_sidecar_file("metadata.json.1234.5.tmp"));
        assert!(!is_sidecar_file("weights.safetensors"));
        assert!(!is_sidecar_file("model.json"));
    }
}
