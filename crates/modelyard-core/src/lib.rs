//! Modelyard Core — canonical model storage and projection for a desktop
//! application manager.
//!
//! Three subsystems cooperate here:
//!
//! - the **model library** stores each downloaded/imported AI model once,
//!   with atomic JSON metadata sidecars and a rebuildable SQLite index;
//! - the **link registry** durably records every filesystem link created to
//!   expose library content to an application, and sweeps their health;
//! - the **mapper** evaluates declarative, versioned rule sets to decide
//!   which files get linked into which application directories, with a
//!   side-effect-free preview that can never diverge from apply.
//!
//! The whole layer is synchronous and blocking; one active host process per
//! library is assumed.
//!
//! # Example
//!
//! ```rust,no_run
//! use modelyard_core::{ModelLibrary, ModelMapper};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! fn main() -> modelyard_core::Result<()> {
//!     let library = Arc::new(ModelLibrary::open("/data/models")?);
//!     let mapper = ModelMapper::new(library.clone(), "/data/mapping-configs");
//!
//!     let preview = mapper.preview_mapping("comfyui", "0.6.0", Path::new("/apps/comfyui/models"))?;
//!     println!("{} links to create", preview.to_create.len());
//!
//!     let report = mapper.apply_for_app("comfyui", "0.6.0", Path::new("/apps/comfyui/models"))?;
//!     println!("created {} links", report.created);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod library;
pub mod linker;
pub mod mapper;
pub mod metadata;
pub mod platform;
pub mod registry;

// Re-export commonly used types
pub use error::{ErrorKind, ModelyardError, Result};
pub use index::{IndexEntry, ModelIndex};
pub use io::IoThrottle;
pub use library::{
    available_algorithms, compute_dual_hash, normalize_filename, normalize_name, unique_path,
    DualHash, HashAlgorithm, ModelLibrary, ModelMetadata, ModelOverrides,
};
pub use linker::{create_link, default_strategy, remove_link, verify_link, LinkState, LinkStrategy};
pub use mapper::{MappingConfig, MappingPreview, MappingReport, MappingRule, ModelMapper};
pub use platform::{
    check_symlink_capability, detect_sandbox_environment, is_filesystem_writable, is_ntfs_dirty,
    is_path_on_readonly_mount, DriveDetector, DriveType, SandboxInfo,
};
pub use registry::{HealthReport, HealthStatus, LinkRecord, LinkRegistry, LinkSpec};
