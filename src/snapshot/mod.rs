//! Snapshot Subsystem
//!
//! Periodically persists each stash to disk and restores it on startup.
//!
//! ## Crash Safety
//!
//! Every snapshot is written to a staging file and committed by an atomic
//! rename over the committed file, so a crash mid-write leaves the previous
//! committed snapshot intact. A crash mid-rename at worst truncates the
//! trailing record, which the reader tolerates.
//!
//! ## Modules
//!
//! - `format`: the binary file layout and its encode/decode helpers
//! - `writer`: streams a stash to its staging file and commits it
//! - `reader`: startup restore of every committed snapshot in the data dir
//! - `scheduler`: the per-stash periodic task gated on the dirty flag

pub mod format;
pub mod reader;
pub mod scheduler;
pub mod writer;

pub use format::{FormatError, SnapshotMeta};
pub use reader::restore_all;
pub use scheduler::{SnapshotScheduler, DEFAULT_SNAPSHOT_INTERVAL};
pub use writer::write_snapshot;

use std::path::Path;

/// Removes a stash's snapshot file pair. Used by DROP; missing files are
/// fine.
pub fn delete_snapshot_files(dir: &Path, name: &str) {
    let _ = std::fs::remove_file(format::staging_path(dir, name));
    let _ = std::fs::remove_file(format::committed_path(dir, name));
}
