//! Phase 1: forward propagation.
//!
//! Evaluates all seven tables. Table 1 streams f1 over the whole x space;
//! each further table matches pairs from the previous table's sorted
//! stream and mixes them through Fx. Every table lands in a sort manager
//! keyed on its f value, and as a table is drained for matching its
//! entries are rewritten compactly (x, or pos + offset) into the table's
//! temporary file for phases 2 and 3.

use crate::fx::{F1Generator, FxCalculator, Matcher, Meta};
use crate::plotter::PlotContext;
use crate::progress::ProgressCallback;
use orchard_common::bits::{slice_u64_full, BitWriter};
use orchard_common::constants::*;
use orchard_common::entry_sizes::max_entry_size;
use orchard_common::{cdiv, PlotError, Result};
use orchard_disk::{BufferedDisk, Disk, FileDisk};
use orchard_sort::{SortManager, SortStrategy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{info, warn};

/// A left-table entry buffered for matching.
#[derive(Clone, Copy)]
struct LeftEntry {
    y: u64,
    /// Index in the sorted left stream; becomes the match's pos field.
    pos: u64,
    meta: Meta,
}

/// One unit of matching work: two adjacent y-buckets.
struct MatchJob {
    left: std::sync::Arc<Vec<LeftEntry>>,
    right: std::sync::Arc<Vec<LeftEntry>>,
}

/// Where matched entries of the next table go.
enum RightSink {
    /// Tables 2..6: the next sort manager, keyed on f.
    Sorter(SortManager),
    /// Table 7: straight to its temporary file.
    File(BufferedDisk),
}

struct SinkState {
    sink: RightSink,
    count: u64,
    dropped: u64,
    entry_size: usize,
    cap: u64,
}

impl SinkState {
    fn add(&mut self, entry: &[u8]) -> Result<()> {
        if self.count >= self.cap {
            self.dropped += 1;
            return Ok(());
        }
        match &mut self.sink {
            RightSink::Sorter(sm) => sm.add(entry)?,
            RightSink::File(disk) => disk.write(self.count * self.entry_size as u64, entry)?,
        }
        self.count += 1;
        Ok(())
    }
}

/// Unwraps a worker's result, re-raising its panic if it had one.
fn join_worker(handle: std::thread::ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Runs phase 1; returns the number of entries in each table.
pub fn run(ctx: &PlotContext, progress: &ProgressCallback) -> Result<[u64; 8]> {
    let k = ctx.k;
    let num_entries = 1u64 << k;
    let mut table_sizes = [0u64; 8];

    let start = Instant::now();
    let mut left_sm = compute_f1(ctx)?;
    table_sizes[1] = num_entries;
    info!(
        "table 1 complete: {} entries in {:.2?}",
        num_entries,
        start.elapsed()
    );
    progress(1, 1, 7);

    for t in 1..=6u8 {
        let start = Instant::now();
        let (next_sm, written) =
            compute_matches(ctx, t, &mut left_sm, table_sizes[t as usize])?;
        info!(
            "table {} complete: {} entries in {:.2?}",
            t + 1,
            written,
            start.elapsed()
        );
        table_sizes[t as usize + 1] = written;
        progress(1, t as u64 + 1, 7);

        // The drained sort manager owns this table's bucket files; its
        // compact rewrite is already on disk.
        drop(left_sm);
        left_sm = match next_sm {
            Some(sm) => sm,
            None => break,
        };
    }

    Ok(table_sizes)
}

/// Streams f1 over x in [0, 2^k), in stripes pulled by worker threads.
fn compute_f1(ctx: &PlotContext) -> Result<SortManager> {
    let k = ctx.k;
    let num_entries = 1u64 << k;
    let entry_size = max_entry_size(k, 1, true) as usize;

    let sm = Mutex::new(SortManager::new(ctx.sort_config(
        1,
        1,
        entry_size,
        0,
        SortStrategy::QuicksortLast,
    ))?);
    let next_stripe = AtomicU64::new(0);

    let workers = ctx.num_threads.max(1) as usize;
    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(scope.spawn(|| -> Result<()> {
                let f1 = F1Generator::new(k, &ctx.id);
                let mut packer = BitWriter::new();
                let mut local = Vec::with_capacity(ctx.stripe_size as usize * entry_size);
                loop {
                    let x = next_stripe.fetch_add(1, Ordering::SeqCst) * ctx.stripe_size;
                    if x >= num_entries {
                        return Ok(());
                    }
                    let count = ctx.stripe_size.min(num_entries - x);
                    local.clear();
                    for (y, xv) in f1.generate(x, count) {
                        packer.clear();
                        packer.push(y as u128, k as u32 + K_EXTRA_BITS);
                        packer.push(xv as u128, k as u32);
                        packer.pad_to_byte();
                        local.extend_from_slice(packer.as_slice());
                    }
                    let mut guard = sm.lock();
                    for entry in local.chunks(entry_size) {
                        guard.add(entry)?;
                    }
                }
            }));
        }
        handles.into_iter().map(join_worker).collect()
    });
    for r in results {
        r?;
    }

    let mut sm = sm.into_inner();
    sm.flush()?;
    Ok(sm)
}

/// Matches table t against itself to produce table t + 1.
///
/// The main thread drains the left sort manager in y order, rewrites each
/// left entry compactly to the table file, groups entries by K_BC bucket
/// and queues adjacent bucket pairs; workers match, evaluate Fx, and feed
/// the right sink. Returns the next table's sort manager (None for 7) and
/// the number of entries written.
fn compute_matches(
    ctx: &PlotContext,
    t: u8,
    left: &mut SortManager,
    left_count: u64,
) -> Result<(Option<SortManager>, u64)> {
    let k = ctx.k as u32;
    let left_entry_size = max_entry_size(ctx.k, t, true) as usize;
    let left_meta_bits = k * K_VECTOR_LENS[t as usize + 1];
    let right_entry_size = max_entry_size(ctx.k, t + 1, true) as usize;

    // Compact rewrite of the left table, in y order.
    let compact_size = if t == 1 {
        cdiv(k, 8)
    } else {
        cdiv(k + K_OFFSET_SIZE, 8)
    } as usize;
    let compact_file = FileDisk::new(ctx.table_path(t), ctx.retry)?;
    let mut compact = BufferedDisk::new(compact_file, 0);

    let sink = Mutex::new(SinkState {
        sink: if t + 1 < 7 {
            RightSink::Sorter(SortManager::new(ctx.sort_config(
                1,
                t + 1,
                right_entry_size,
                0,
                SortStrategy::QuicksortLast,
            ))?)
        } else {
            RightSink::File(BufferedDisk::new(
                FileDisk::new(ctx.table_path(7), ctx.retry)?,
                0,
            ))
        },
        count: 0,
        dropped: 0,
        entry_size: right_entry_size,
        cap: 1u64 << k,
    });

    let workers = ctx.num_threads.max(1) as usize;
    let (tx, rx) = mpsc::sync_channel::<MatchJob>(workers * 2);
    let rx = Mutex::new(rx);

    let (scan_result, worker_results) = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = &rx;
            let sink = &sink;
            handles.push(scope.spawn(move || -> Result<()> {
                let fx = FxCalculator::new(ctx.k, t + 1);
                let mut matcher = Matcher::new();
                let mut pairs: Vec<(u16, u16)> = Vec::new();
                let mut left_ys: Vec<u64> = Vec::new();
                let mut right_ys: Vec<u64> = Vec::new();
                let mut packer = BitWriter::new();
                let mut local: Vec<u8> = Vec::new();
                loop {
                    let job = match rx.lock().recv() {
                        Ok(job) => job,
                        Err(_) => return Ok(()),
                    };
                    left_ys.clear();
                    left_ys.extend(job.left.iter().map(|e| e.y));
                    right_ys.clear();
                    right_ys.extend(job.right.iter().map(|e| e.y));
                    pairs.clear();
                    matcher.find_matches(&left_ys, &right_ys, &mut pairs);

                    local.clear();
                    let mut skipped = 0u64;
                    for &(i, j) in &pairs {
                        let l = &job.left[i as usize];
                        let r = &job.right[j as usize];
                        let offset = r.pos - l.pos;
                        if offset >= 1 << K_OFFSET_SIZE || l.pos >> k != 0 {
                            skipped += 1;
                            continue;
                        }
                        let (y_new, meta_new) = fx.calculate(l.y, &l.meta, &r.meta);
                        packer.clear();
                        if t + 1 < 7 {
                            packer.push(y_new as u128, k + K_EXTRA_BITS);
                            packer.push(l.pos as u128, k);
                            packer.push(offset as u128, K_OFFSET_SIZE);
                            meta_new.append_to(&mut packer);
                        } else {
                            packer.push((y_new >> K_EXTRA_BITS) as u128, k);
                            packer.push(l.pos as u128, k);
                            packer.push(offset as u128, K_OFFSET_SIZE);
                        }
                        packer.pad_to_byte();
                        local.extend_from_slice(packer.as_slice());
                        let pad = right_entry_size - packer.bit_len() / 8;
                        local.extend(std::iter::repeat(0u8).take(pad));
                    }
                    if skipped > 0 {
                        warn!("dropped {} matches with out-of-range offsets", skipped);
                    }
                    let mut guard = sink.lock();
                    for entry in local.chunks(right_entry_size) {
                        guard.add(entry)?;
                    }
                }
            }));
        }

        // Scan the sorted left stream.
        let scan = (|| -> Result<()> {
            let mut packer = BitWriter::new();
            let mut group: Vec<LeftEntry> = Vec::new();
            let mut group_bucket = 0u64;
            let mut prev: Option<(u64, std::sync::Arc<Vec<LeftEntry>>)> = None;

            let mut dispatch = |bucket: u64,
                               entries: Vec<LeftEntry>,
                               prev: &mut Option<(u64, std::sync::Arc<Vec<LeftEntry>>)>|
             -> Result<()> {
                let group = std::sync::Arc::new(entries);
                if let Some((prev_bucket, prev_group)) = prev.take() {
                    if prev_bucket + 1 == bucket {
                        tx.send(MatchJob {
                            left: prev_group,
                            right: group.clone(),
                        })
                        .map_err(|_| {
                            PlotError::Corruption("match worker hung up early".to_string())
                        })?;
                    }
                }
                *prev = Some((bucket, group));
                Ok(())
            };

            for idx in 0..left_count {
                let entry = left.read_entry(idx * left_entry_size as u64)?;
                let y = slice_u64_full(entry, 0, k + K_EXTRA_BITS);
                let meta_start = if t == 1 { k + K_EXTRA_BITS } else { k + K_EXTRA_BITS + k + K_OFFSET_SIZE };
                let meta = Meta::from_slice(entry, meta_start, left_meta_bits);

                // Compact rewrite: x for table 1, pos + offset above.
                packer.clear();
                if t == 1 {
                    let x = slice_u64_full(entry, k + K_EXTRA_BITS, k);
                    packer.push(x as u128, k);
                } else {
                    let pos = slice_u64_full(entry, k + K_EXTRA_BITS, k);
                    let offset = slice_u64_full(entry, k + K_EXTRA_BITS + k, K_OFFSET_SIZE);
                    packer.push(pos as u128, k);
                    packer.push(offset as u128, K_OFFSET_SIZE);
                }
                packer.pad_to_byte();
                compact.write(idx * compact_size as u64, packer.as_slice())?;

                let bucket = y / K_BC;
                if group.is_empty() || bucket == group_bucket {
                    group_bucket = bucket;
                    group.push(LeftEntry { y, pos: idx, meta });
                    continue;
                }
                let done = std::mem::take(&mut group);
                dispatch(group_bucket, done, &mut prev)?;
                group_bucket = bucket;
                group.push(LeftEntry { y, pos: idx, meta });
            }
            if !group.is_empty() {
                dispatch(group_bucket, group, &mut prev)?;
            }
            Ok(())
        })();
        drop(tx);

        let worker_results: Vec<Result<()>> = handles.into_iter().map(join_worker).collect();
        (scan, worker_results)
    });
    scan_result?;
    for r in worker_results {
        r?;
    }

    compact.flush_cache()?;
    let mut sink = sink.into_inner();
    if sink.dropped > 0 {
        warn!(
            "table {} overflowed its {} entry budget; dropped {}",
            t + 1,
            sink.cap,
            sink.dropped
        );
    }
    let written = sink.count;
    let next = match sink.sink {
        RightSink::Sorter(mut sm) => {
            sm.flush()?;
            Some(sm)
        }
        RightSink::File(mut disk) => {
            disk.flush_cache()?;
            None
        }
    };
    Ok((next, written))
}
