//! Disk abstractions for the Orchard plotter.
//!
//! Three layers share one capability set: a raw positional file with
//! transient-error retry, a buffered wrapper optimized for sequential
//! scans, and a read-only filtered view that skips entries a bitfield has
//! pruned. Temporary table files move through all three during a plot.

pub mod bitfield;
pub mod buffered;
pub mod file;
pub mod filtered;

pub use bitfield::{Bitfield, BitfieldIndex};
pub use buffered::BufferedDisk;
pub use file::FileDisk;
pub use filtered::FilteredDisk;

use orchard_common::Result;
use std::path::Path;

/// The capability set shared by writable disk layers.
///
/// `read` returns bytes borrowed from the layer's internal buffer; callers
/// copy out what they keep. The filtered view is deliberately not a `Disk`:
/// it has no write capability at the type level.
pub trait Disk {
    /// Returns `length` bytes starting at `begin`.
    fn read(&mut self, begin: u64, length: u64) -> Result<&[u8]>;

    /// Writes `buf` at `begin`.
    fn write(&mut self, begin: u64, buf: &[u8]) -> Result<()>;

    /// Truncates the underlying file to `new_size` bytes.
    fn truncate(&mut self, new_size: u64) -> Result<()>;

    /// Path of the backing file.
    fn file_name(&self) -> &Path;

    /// Drops internal caches.
    fn free_memory(&mut self);
}
