//! Streaming hash computation for model files.
//!
//! Files are read once in fixed 8 MiB chunks and every configured digest is
//! fed from the same pass, so memory stays bounded no matter how large the
//! model file is.
//!
//! BLAKE3 sits behind the `blake3-hash` feature. Callers that care should
//! branch on [`available_algorithms`] rather than inspecting the secondary
//! slot of [`DualHash`]; an empty string there means "not computed", never
//! "computed to zero".

use crate::config::HashingConfig;
use crate::error::{ModelyardError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Digest algorithms this build can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    /// Canonical lowercase name, matching the metadata hash keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }
}

/// The set of algorithms available in this build.
pub fn available_algorithms() -> &'static [HashAlgorithm] {
    #[cfg(feature = "blake3-hash")]
    {
        &[HashAlgorithm::Sha256, HashAlgorithm::Blake3]
    }
    #[cfg(not(feature = "blake3-hash"))]
    {
        &[HashAlgorithm::Sha256]
    }
}

/// Dual hash result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DualHash {
    /// SHA-256 as lowercase hex.
    pub sha256: String,
    /// BLAKE3 as lowercase hex, or `""` when the algorithm is unavailable.
    pub blake3: String,
}

/// Compute SHA-256 and (when available) BLAKE3 in a single pass.
pub fn compute_dual_hash(path: impl AsRef<Path>) -> Result<DualHash> {
    let path = path.as_ref();
    let mut file =
        std::fs::File::open(path).map_err(|e| ModelyardError::io_with_path(e, path))?;

    let mut sha256_hasher = Sha256::new();
    #[cfg(feature = "blake3-hash")]
    let mut blake3_hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; HashingConfig::CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ModelyardError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }

        sha256_hasher.update(&buffer[..bytes_read]);
        #[cfg(feature = "blake3-hash")]
        blake3_hasher.update(&buffer[..bytes_read]);
    }

    let sha256 = hex::encode(sha256_hasher.finalize());

    #[cfg(feature = "blake3-hash")]
    let blake3 = blake3_hasher.finalize().to_hex().to_string();
    #[cfg(not(feature = "blake3-hash"))]
    let blake3 = String::new();

    Ok(DualHash { sha256, blake3 })
}

/// Verify a file's SHA-256 against an expected lowercase hex value.
///
/// Returns `Ok(())` on match, [`ModelyardError::HashMismatch`] otherwise.
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let mut file =
        std::fs::File::open(path).map_err(|e| ModelyardError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HashingConfig::CHUNK_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ModelyardError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let actual = hex::encode(hasher.finalize());
    let expected_lower = expected.to_lowercase();

    if actual == expected_lower {
        Ok(())
    } else {
        Err(ModelyardError::HashMismatch {
            expected: expected_lower,
            actual,
        })
    }
}
