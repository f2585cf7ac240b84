//! Plot orchestration: admission checks, temp-file lifecycle, the four
//! phases, and the final rename.

use crate::progress::ProgressCallback;
use crate::{phase1, phase2, phase3, phase4};
use orchard_common::config::{PlotterConfig, RetryPolicy};
use orchard_common::constants::*;
use orchard_common::entry_sizes::max_entry_size;
use orchard_common::{cdiv, PlotError, Result};
use orchard_disk::FileDisk;
use orchard_sort::{SortConfig, SortStrategy};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Parameters shared by every phase of one plotting run.
pub struct PlotContext {
    pub k: u8,
    pub id: [u8; K_ID_LEN],
    pub tmp_dir: PathBuf,
    pub filename: String,
    pub memory_size: u64,
    pub num_buckets: u32,
    pub log_num_buckets: u32,
    pub stripe_size: u64,
    pub num_threads: u8,
    pub retry: RetryPolicy,
}

impl PlotContext {
    /// Path of table t's temporary file.
    pub fn table_path(&self, t: u8) -> PathBuf {
        self.tmp_dir
            .join(format!("{}.table{}.tmp", self.filename, t))
    }

    /// Path of the sort spare file.
    pub fn sort_path(&self) -> PathBuf {
        self.tmp_dir.join(format!("{}.sort.tmp", self.filename))
    }

    /// Sort-manager configuration for one pass over one table. `pass`
    /// keeps concurrent managers' bucket files distinct.
    pub fn sort_config(
        &self,
        pass: u8,
        table: u8,
        entry_size: usize,
        begin_bits: u32,
        strategy: SortStrategy,
    ) -> SortConfig {
        SortConfig {
            // Two managers are commonly alive at once (one draining, one
            // filling), so each owns half the budget.
            memory_size: self.memory_size / 2,
            num_buckets: self.num_buckets,
            log_num_buckets: self.log_num_buckets,
            entry_size,
            begin_bits,
            stripe_size: self.stripe_size,
            strategy,
            tmp_dir: self.tmp_dir.clone(),
            name: format!("{}.s{}.t{}", self.filename, pass, table),
            retry: self.retry,
        }
    }
}

/// Size of one entry in table t's temporary file after phase 1: table 1
/// holds bare x values, tables 2..6 hold (pos, offset), table 7 keeps f7
/// alongside its back-pointer.
pub fn table_file_entry_size(k: u8, table_index: u8) -> u32 {
    match table_index {
        1 => cdiv(k as u32, 8),
        2..=6 => cdiv(k as u32 + K_OFFSET_SIZE, 8),
        _ => max_entry_size(k, 7, false),
    }
}

/// Largest power of two at most `x`.
fn round_pow2(x: u64) -> u64 {
    debug_assert!(x >= 1);
    1 << (63 - x.leading_zeros())
}

/// Creates proof-of-space plot files on disk.
#[derive(Debug, Default)]
pub struct DiskPlotter;

impl DiskPlotter {
    pub fn new() -> Self {
        Self
    }

    /// Builds a plot through the four phases and moves it into
    /// `final_dir/filename`. Temporary files live under `tmp_dir` and the
    /// assembled file under `tmp2_dir` until the final rename.
    #[allow(clippy::too_many_arguments)]
    pub fn create_plot_disk(
        &self,
        tmp_dir: &Path,
        tmp2_dir: &Path,
        final_dir: &Path,
        filename: &str,
        k: u8,
        memo: &[u8],
        id: &[u8; K_ID_LEN],
        config: &PlotterConfig,
        progress: &ProgressCallback,
    ) -> Result<PathBuf> {
        if !(K_MIN_PLOT_SIZE..=K_MAX_PLOT_SIZE).contains(&k) {
            return Err(PlotError::InvalidValue(format!(
                "plot size k = {} is invalid",
                k
            )));
        }
        if memo.len() > u16::MAX as usize {
            return Err(PlotError::InvalidValue(format!(
                "memo of {} bytes does not fit the header",
                memo.len()
            )));
        }
        for (dir, what) in [(tmp_dir, "temp"), (tmp2_dir, "temp2"), (final_dir, "final")] {
            if !dir.exists() {
                return Err(PlotError::InvalidValue(format!(
                    "{} directory {} does not exist",
                    what,
                    dir.display()
                )));
            }
        }

        let stripe_size = if config.stripe_size != 0 {
            config.stripe_size
        } else {
            65536
        };
        let num_threads = if config.num_threads != 0 {
            config.num_threads
        } else {
            2
        };
        let buf_megabytes = if config.buf_megabytes != 0 {
            config.buf_megabytes
        } else {
            4608
        };
        if buf_megabytes < 10 {
            return Err(PlotError::InsufficientMemory(
                "please provide at least 10 MiB of ram".to_string(),
            ));
        }

        // Reserve room for dynamic allocation outside the sort buffers.
        let thread_memory = num_threads as u64
            * (2 * (stripe_size + K_STRIPE_BUFFER_MARGIN))
            * max_entry_size(k, 4, true) as u64
            / (1024 * 1024);
        let sub_mbytes = 5 + (buf_megabytes as f64 * 0.05).min(50.0) as u64 + thread_memory;
        if sub_mbytes > buf_megabytes as u64 {
            return Err(PlotError::InsufficientMemory(format!(
                "please provide more memory, at least {} MiB",
                sub_mbytes
            )));
        }
        let memory_size = (buf_megabytes as u64 - sub_mbytes) * 1024 * 1024;

        let mut max_table_size = 0f64;
        for t in 1..=7u8 {
            let size = 1.3 * (1u64 << k) as f64 * max_entry_size(k, t, true) as f64;
            if size > max_table_size {
                max_table_size = size;
            }
        }

        let user_buckets = config.num_buckets != 0;
        let mut num_buckets = if user_buckets {
            round_pow2(config.num_buckets as u64) as u32
        } else {
            let needed =
                (max_table_size / (memory_size as f64 * K_MEM_SORT_PROPORTION)).ceil() as u64;
            (2 * round_pow2(needed.max(1))) as u32
        };
        if num_buckets < K_MIN_BUCKETS {
            if user_buckets {
                return Err(PlotError::InvalidValue(format!(
                    "minimum buckets is {}",
                    K_MIN_BUCKETS
                )));
            }
            num_buckets = K_MIN_BUCKETS;
        } else if num_buckets > K_MAX_BUCKETS {
            if user_buckets {
                return Err(PlotError::InvalidValue(format!(
                    "maximum buckets is {}",
                    K_MAX_BUCKETS
                )));
            }
            let required_mem = (max_table_size / K_MAX_BUCKETS as f64) / K_MEM_SORT_PROPORTION
                / (1024.0 * 1024.0)
                + sub_mbytes as f64;
            return Err(PlotError::InsufficientMemory(format!(
                "do not have enough memory, need {:.2} MiB",
                required_mem
            )));
        }
        let log_num_buckets = num_buckets.trailing_zeros();

        if max_table_size / (num_buckets as f64) < (stripe_size * 30) as f64 {
            return Err(PlotError::InvalidValue("stripe size too large".to_string()));
        }

        info!(
            "starting plot: k = {}, id = {}, buffer = {} MiB, {} buckets, {} threads, stripe {}",
            k,
            hex_string(id),
            buf_megabytes,
            num_buckets,
            num_threads,
            stripe_size
        );

        let ctx = PlotContext {
            k,
            id: *id,
            tmp_dir: tmp_dir.to_path_buf(),
            filename: filename.to_string(),
            memory_size,
            num_buckets,
            log_num_buckets,
            stripe_size,
            num_threads,
            retry: config.retry,
        };

        let tmp2_path = tmp2_dir.join(format!("{}.2.tmp", filename));
        let final_2_path = final_dir.join(format!("{}.2.tmp", filename));
        let final_path = final_dir.join(filename);

        // Stale files from a crashed run go first.
        for t in 1..=7u8 {
            let _ = std::fs::remove_file(ctx.table_path(t));
        }
        let _ = std::fs::remove_file(ctx.sort_path());
        let _ = std::fs::remove_file(&tmp2_path);
        let _ = std::fs::remove_file(&final_path);

        // The sort spare exists for the lifetime of the run.
        let sort_spare = FileDisk::new(ctx.sort_path(), ctx.retry)?;

        let all_phases = Instant::now();
        info!("starting phase 1/4: forward propagation into tmp files");
        let p1 = Instant::now();
        let table_sizes = phase1::run(&ctx, progress)?;
        info!("phase 1 complete in {:.2?}", p1.elapsed());

        info!("starting phase 2/4: back-propagation");
        let p2 = Instant::now();
        let res2 = phase2::run(&ctx, &table_sizes, config.no_bitfield, progress)?;
        info!("phase 2 complete in {:.2?}", p2.elapsed());

        let mut tmp2 = FileDisk::new(&tmp2_path, ctx.retry)?;
        let header_size = write_header(&mut tmp2, k, id, memo)?;

        info!(
            "starting phase 3/4: compression into {}",
            tmp2_path.display()
        );
        let p3 = Instant::now();
        let mut res3 = phase3::run(&ctx, &mut tmp2, res2, header_size, progress)?;
        info!("phase 3 complete in {:.2?}", p3.elapsed());

        info!("starting phase 4/4: checkpoint tables");
        let p4 = Instant::now();
        let final_size = phase4::run(&ctx, &mut tmp2, &mut res3, header_size, progress)?;
        info!("phase 4 complete in {:.2?}", p4.elapsed());

        let mut working_space = 0u64;
        for t in 1..=7u8 {
            working_space += table_sizes[t as usize] * max_entry_size(k, t, false) as u64;
        }
        info!(
            "approximate working space used: {:.3} GiB, final file: {:.3} GiB, total {:.2?}",
            working_space as f64 / (1u64 << 30) as f64,
            final_size as f64 / (1u64 << 30) as f64,
            all_phases.elapsed()
        );

        drop(res3);
        drop(sort_spare);
        drop(tmp2);
        for t in 1..=7u8 {
            let _ = std::fs::remove_file(ctx.table_path(t));
        }
        let _ = std::fs::remove_file(ctx.sort_path());

        finalize(&tmp2_path, &final_2_path, &final_path, config.retry)?;
        Ok(final_path)
    }
}

/// Moves the finished plot into place, retrying forever. A same-directory
/// move is one rename; across filesystems the file is copied next to its
/// destination first, then renamed.
fn finalize(
    tmp2_path: &Path,
    final_2_path: &Path,
    final_path: &Path,
    retry: RetryPolicy,
) -> Result<()> {
    let same_dir = tmp2_path.parent() == final_path.parent();
    let mut copied = false;
    loop {
        if same_dir {
            match std::fs::rename(tmp2_path, final_path) {
                Ok(()) => {
                    info!(
                        "renamed final file from {} to {}",
                        tmp2_path.display(),
                        final_path.display()
                    );
                    return Ok(());
                }
                Err(e) => warn!(
                    "could not rename {} to {}: {}. Retrying in {:?}",
                    tmp2_path.display(),
                    final_path.display(),
                    e,
                    retry.backoff
                ),
            }
        } else {
            if !copied {
                match std::fs::copy(tmp2_path, final_2_path) {
                    Ok(_) => {
                        info!(
                            "copied final file from {} to {}",
                            tmp2_path.display(),
                            final_2_path.display()
                        );
                        copied = true;
                        let _ = std::fs::remove_file(tmp2_path);
                    }
                    Err(e) => warn!(
                        "could not copy {} to {}: {}. Retrying in {:?}",
                        tmp2_path.display(),
                        final_2_path.display(),
                        e,
                        retry.backoff
                    ),
                }
            }
            if copied {
                match std::fs::rename(final_2_path, final_path) {
                    Ok(()) => {
                        info!(
                            "renamed final file from {} to {}",
                            final_2_path.display(),
                            final_path.display()
                        );
                        return Ok(());
                    }
                    Err(e) => warn!(
                        "could not rename {} to {}: {}. Retrying in {:?}",
                        final_2_path.display(),
                        final_path.display(),
                        e,
                        retry.backoff
                    ),
                }
            }
        }
        std::thread::sleep(retry.backoff);
    }
}

/// Writes the plot file header; returns its size in bytes.
///
/// Layout: magic, id, k, format description (length-prefixed), memo
/// (length-prefixed), then ten zeroed big-endian table pointers patched by
/// phase 4.
pub fn write_header(
    disk: &mut FileDisk,
    k: u8,
    id: &[u8; K_ID_LEN],
    memo: &[u8],
) -> Result<u32> {
    let magic = b"Proof of Space Plot";
    let mut pos = 0u64;
    disk.write(pos, magic)?;
    pos += magic.len() as u64;
    disk.write(pos, id)?;
    pos += K_ID_LEN as u64;
    disk.write(pos, &[k])?;
    pos += 1;

    let fmt = K_FORMAT_DESCRIPTION.as_bytes();
    disk.write(pos, &(fmt.len() as u16).to_be_bytes())?;
    pos += 2;
    disk.write(pos, fmt)?;
    pos += fmt.len() as u64;

    disk.write(pos, &(memo.len() as u16).to_be_bytes())?;
    pos += 2;
    disk.write(pos, memo)?;
    pos += memo.len() as u64;

    disk.write(pos, &[0u8; 80])?;
    pos += 80;

    info!("wrote plot header: {} bytes", pos);
    Ok(pos as u32)
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
