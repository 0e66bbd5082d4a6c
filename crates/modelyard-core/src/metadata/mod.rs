//! Atomic JSON persistence for metadata sidecar files.

mod atomic;

pub use atomic::{atomic_read_json, atomic_write_json};
