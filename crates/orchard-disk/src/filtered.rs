//! Read-only pruned view over a table file.

use crate::bitfield::Bitfield;
use crate::buffered::BufferedDisk;
use crate::Disk;
use orchard_common::Result;
use std::path::Path;

/// Presents the surviving entries of a table as a contiguous file.
///
/// Logical offsets address only entries whose filter bit is set; the view
/// maps them to physical offsets by skipping cleared bits. The cursor moves
/// forward only, one logical entry at a time, which is the access pattern
/// of every phase-3 scan. There is deliberately no write capability.
pub struct FilteredDisk {
    filter: Bitfield,
    underlying: BufferedDisk,
    entry_size: u64,
    last_physical: u64,
    last_logical: u64,
    last_idx: u64,
}

impl FilteredDisk {
    /// Wraps `underlying`, exposing only entries set in `filter`.
    pub fn new(underlying: BufferedDisk, filter: Bitfield, entry_size: u64) -> Self {
        debug_assert!(entry_size > 0);
        // Park the cursor on the first surviving entry.
        let mut idx = 0u64;
        let mut physical = 0u64;
        while idx < filter.len() && !filter.get(idx) {
            physical += entry_size;
            idx += 1;
        }
        Self {
            filter,
            underlying,
            entry_size,
            last_physical: physical,
            last_logical: 0,
            last_idx: idx,
        }
    }

    /// Reads `length` bytes at logical offset `begin`.
    ///
    /// `begin` must be entry-aligned and non-decreasing across calls.
    pub fn read(&mut self, begin: u64, length: u64) -> Result<&[u8]> {
        debug_assert!(begin >= self.last_logical);
        debug_assert_eq!(begin % self.entry_size, 0);

        if begin > self.last_logical {
            // The cursor always rests on a surviving entry, so advancing
            // takes at least one step on every counter.
            self.last_logical += self.entry_size;
            self.last_physical += self.entry_size;
            self.last_idx += 1;

            while begin > self.last_logical {
                if self.filter.get(self.last_idx) {
                    self.last_logical += self.entry_size;
                }
                self.last_physical += self.entry_size;
                self.last_idx += 1;
            }

            while self.last_idx < self.filter.len() && !self.filter.get(self.last_idx) {
                self.last_physical += self.entry_size;
                self.last_idx += 1;
            }
        }

        debug_assert_eq!(self.last_physical, self.last_idx * self.entry_size);
        self.underlying.read(self.last_physical, length)
    }

    /// Path of the backing file.
    pub fn file_name(&self) -> &Path {
        self.underlying.file_name()
    }

    /// Drops the filter and the underlying caches.
    pub fn free_memory(&mut self) {
        self.filter.free_memory();
        self.underlying.free_memory();
    }
}
