//! The sort manager: bucket-partitioned external sort over fixed-size
//! entries.

use crate::{quicksort, uniform};
use orchard_common::bits::extract_num;
use orchard_common::config::RetryPolicy;
use orchard_common::constants::{K_BC, K_EXTRA_BITS_POW};
use orchard_common::{PlotError, Result};
use orchard_disk::FileDisk;
use std::path::PathBuf;
use tracing::debug;

/// How buckets are sorted once loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStrategy {
    /// Distribution sort; assumes keys are uniform past the bucket prefix.
    Uniform,
    /// Comparison sort; no distribution assumption.
    Quicksort,
    /// Uniform for all buckets except the last. The tail of a key space is
    /// often not uniformly distributed, where uniform sort degrades badly.
    QuicksortLast,
}

/// Construction parameters for a [`SortManager`].
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Bytes available for the in-memory sort buffer and ingest regions.
    pub memory_size: u64,
    /// Number of buckets; must be a power of two.
    pub num_buckets: u32,
    /// log2 of `num_buckets`.
    pub log_num_buckets: u32,
    /// Size of every entry, in bytes.
    pub entry_size: usize,
    /// Bit offset of the sort key within an entry.
    pub begin_bits: u32,
    /// Entries per consumer stripe; sizes the previous-bucket lookback.
    pub stripe_size: u64,
    /// Bucket sort strategy.
    pub strategy: SortStrategy,
    /// Directory for bucket files.
    pub tmp_dir: PathBuf,
    /// Base name for bucket files, e.g. `plot.dat.p1.t2`.
    pub name: String,
    /// Retry policy for bucket file I/O.
    pub retry: RetryPolicy,
}

/// The explicit lifecycle of a sort manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortState {
    /// Accepting entries into bucket scratch regions.
    Ingest,
    /// Serving sorted entries; `next_bucket` is the next one to load.
    Emit { next_bucket: u32 },
    /// Every bucket has been sorted; the last one is still readable.
    Done,
}

struct Bucket {
    file: FileDisk,
    /// Bytes written to the bucket file.
    write_pointer: u64,
    /// Bytes currently held in this bucket's scratch region.
    scratch_used: usize,
}

/// External bucket sort over fixed-size bit-packed entries.
///
/// Ingest distributes entries to per-bucket files through in-memory scratch
/// regions; emit lazily sorts one bucket at a time into the shared buffer
/// as the consumer's position crosses bucket boundaries. Entries compare by
/// memcmp from `begin_bits`; the bucket index is the key's high prefix, so
/// the emitted concatenation is globally sorted.
pub struct SortManager {
    cfg: SortConfig,
    memory: Vec<u8>,
    region_size: usize,
    buckets: Vec<Bucket>,
    state: SortState,

    /// Tail of the previously emitted bucket, kept addressable for one
    /// stripe of consumer lookback.
    prev_bucket_buf: Vec<u8>,
    prev_bucket_position_start: u64,

    final_position_start: u64,
    final_position_end: u64,
    /// Bytes of sorted data currently in `memory`.
    sorted_len: usize,
}

impl SortManager {
    /// Creates the manager and its bucket files.
    pub fn new(cfg: SortConfig) -> Result<Self> {
        debug_assert!(cfg.num_buckets.is_power_of_two());
        debug_assert_eq!(1u32 << cfg.log_num_buckets, cfg.num_buckets);
        let mut region_size = (cfg.memory_size / cfg.num_buckets as u64) as usize;
        region_size -= region_size % cfg.entry_size;
        if region_size == 0 {
            return Err(PlotError::InsufficientMemory(format!(
                "{} bytes cannot hold one entry per bucket region",
                cfg.memory_size
            )));
        }

        let mut buckets = Vec::with_capacity(cfg.num_buckets as usize);
        for i in 0..cfg.num_buckets {
            let path = cfg
                .tmp_dir
                .join(format!("{}.sort_bucket_{:03}.tmp", cfg.name, i));
            buckets.push(Bucket {
                file: FileDisk::new(path, cfg.retry)?,
                write_pointer: 0,
                scratch_used: 0,
            });
        }

        let memory = vec![0u8; cfg.memory_size as usize + 7];
        Ok(Self {
            cfg,
            memory,
            region_size,
            buckets,
            state: SortState::Ingest,
            prev_bucket_buf: Vec::new(),
            prev_bucket_position_start: 0,
            final_position_start: 0,
            final_position_end: 0,
            sorted_len: 0,
        })
    }

    /// Size of every entry, in bytes.
    pub fn entry_size(&self) -> usize {
        self.cfg.entry_size
    }

    /// Total bytes ingested so far (flushed or not).
    pub fn total_bytes(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.write_pointer + b.scratch_used as u64)
            .sum()
    }

    /// Adds one entry of `entry_size` bytes.
    pub fn add(&mut self, entry: &[u8]) -> Result<()> {
        debug_assert_eq!(entry.len(), self.cfg.entry_size);
        debug_assert_eq!(self.state, SortState::Ingest, "add after emit started");
        let bucket = extract_num(
            entry,
            self.cfg.entry_size as u32,
            self.cfg.begin_bits,
            self.cfg.log_num_buckets,
        ) as usize;

        if self.buckets[bucket].scratch_used + self.cfg.entry_size > self.region_size {
            self.flush_region(bucket)?;
        }
        let off = bucket * self.region_size + self.buckets[bucket].scratch_used;
        self.memory[off..off + self.cfg.entry_size].copy_from_slice(entry);
        self.buckets[bucket].scratch_used += self.cfg.entry_size;
        Ok(())
    }

    fn flush_region(&mut self, bucket: usize) -> Result<()> {
        let used = self.buckets[bucket].scratch_used;
        if used == 0 {
            return Ok(());
        }
        let off = bucket * self.region_size;
        let write_pointer = self.buckets[bucket].write_pointer;
        self.buckets[bucket]
            .file
            .write(write_pointer, &self.memory[off..off + used])?;
        self.buckets[bucket].write_pointer += used as u64;
        self.buckets[bucket].scratch_used = 0;
        Ok(())
    }

    /// Drains every scratch region to disk and transitions to emit.
    pub fn flush(&mut self) -> Result<()> {
        for bucket in 0..self.buckets.len() {
            self.flush_region(bucket)?;
        }
        if self.state == SortState::Ingest {
            self.state = SortState::Emit { next_bucket: 0 };
        }
        Ok(())
    }

    fn prev_bucket_capacity(&self) -> usize {
        2 * (self.cfg.stripe_size as usize
            + 10 * (K_BC / K_EXTRA_BITS_POW as u64) as usize)
            * self.cfg.entry_size
    }

    /// True when `position` is within half a lookback window of the current
    /// bucket's end and more buckets remain; consumers use this to prefetch.
    pub fn close_to_new_bucket(&self, position: u64) -> bool {
        let more = matches!(self.state, SortState::Emit { .. });
        if position > self.final_position_end {
            return more;
        }
        more && position + (self.prev_bucket_capacity() / 2) as u64 >= self.final_position_end
    }

    /// Loads and sorts the next bucket. `position` must sit at or before
    /// the boundary being crossed.
    pub fn trigger_new_bucket(&mut self, position: u64) -> Result<()> {
        if position > self.final_position_end {
            return Err(PlotError::InvalidValue(
                "triggering a new sort bucket beyond the sorted frontier".to_string(),
            ));
        }
        // Keep the tail of the outgoing bucket addressable for lookback.
        if self.sorted_len > 0 {
            let cap = self.prev_bucket_capacity();
            if self.prev_bucket_buf.is_empty() {
                self.prev_bucket_buf = vec![0u8; cap + 7];
            }
            let tail = cap.min(self.sorted_len);
            self.prev_bucket_buf[..tail]
                .copy_from_slice(&self.memory[self.sorted_len - tail..self.sorted_len]);
            self.prev_bucket_position_start = self.final_position_end - tail as u64;
        }
        self.sort_next_bucket()
    }

    fn sort_next_bucket(&mut self) -> Result<()> {
        let i = match self.state {
            SortState::Emit { next_bucket } => next_bucket,
            SortState::Ingest => {
                return Err(PlotError::InvalidValue(
                    "sort manager still ingesting; flush first".to_string(),
                ))
            }
            SortState::Done => {
                return Err(PlotError::InvalidValue(
                    "all sort buckets already emitted".to_string(),
                ))
            }
        };
        let idx = i as usize;
        let bytes = self.buckets[idx].write_pointer;
        let entries = bytes / self.cfg.entry_size as u64;
        if bytes > self.cfg.memory_size {
            return Err(PlotError::InsufficientMemory(format!(
                "bucket {} holds {} bytes but the sort buffer is {}",
                i, bytes, self.cfg.memory_size
            )));
        }

        let bits_begin = self.cfg.begin_bits + self.cfg.log_num_buckets;
        let last_bucket = i + 1 == self.cfg.num_buckets;
        let want_uniform = match self.cfg.strategy {
            SortStrategy::Uniform => true,
            SortStrategy::Quicksort => false,
            SortStrategy::QuicksortLast => !last_bucket,
        };
        let uniform_fits =
            uniform::round_size(entries) * self.cfg.entry_size as u64 <= self.cfg.memory_size;

        if want_uniform && uniform_fits {
            uniform::sort_to_memory(
                &mut self.buckets[idx].file,
                0,
                &mut self.memory,
                self.cfg.entry_size,
                entries,
                bits_begin,
            )?;
        } else {
            if want_uniform {
                debug!(
                    "bucket {} of {}: uniform sort needs more memory, using quicksort",
                    i, self.cfg.name
                );
            }
            self.buckets[idx]
                .file
                .read(0, &mut self.memory[..bytes as usize])?;
            quicksort::sort(&mut self.memory, self.cfg.entry_size, entries, bits_begin);
        }

        self.final_position_start = self.final_position_end;
        self.final_position_end += bytes;
        self.sorted_len = bytes as usize;
        self.state = if last_bucket {
            SortState::Done
        } else {
            SortState::Emit { next_bucket: i + 1 }
        };
        Ok(())
    }

    /// Returns the entry at byte `position` of the sorted concatenation.
    ///
    /// Positions must be non-decreasing, except for lookback into the
    /// previous bucket's retained tail.
    pub fn read_entry(&mut self, position: u64) -> Result<&[u8]> {
        if self.state == SortState::Ingest {
            self.flush()?;
        }
        if position < self.final_position_start {
            if position < self.prev_bucket_position_start {
                return Err(PlotError::InvalidValue(format!(
                    "sort read at {} regressed past the lookback window at {}",
                    position, self.prev_bucket_position_start
                )));
            }
            let off = (position - self.prev_bucket_position_start) as usize;
            return Ok(&self.prev_bucket_buf[off..off + self.cfg.entry_size]);
        }
        while position >= self.final_position_end {
            self.trigger_new_bucket(self.final_position_end)?;
        }
        let off = (position - self.final_position_start) as usize;
        Ok(&self.memory[off..off + self.cfg.entry_size])
    }

    /// Releases the sort buffer and lookback tail.
    pub fn free_memory(&mut self) {
        self.memory = Vec::new();
        self.prev_bucket_buf = Vec::new();
        self.sorted_len = 0;
    }
}

impl Drop for SortManager {
    fn drop(&mut self) {
        for bucket in &mut self.buckets {
            bucket.file.remove();
        }
    }
}
