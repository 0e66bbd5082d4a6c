//! SQLite model index.
//!
//! A derived cache over the `metadata.json` files on disk. Losing or
//! corrupting it is never fatal: `ModelLibrary::rebuild_index` re-creates it
//! from a full scan.

mod model_index;

pub use model_index::{IndexEntry, ModelIndex};
