//! Phase 3: compression.
//!
//! For each table t in 1..6, the (pos, offset) back-pointers of table t+1
//! are resolved into the two referenced values of table t, folded into a
//! line point, sorted by it, and written out as fixed-size parks. Each
//! entry's rank in line-point order becomes its new key, which renumbers
//! the next iteration's references. Table 7's output is not parked; it is
//! re-keyed by f7 and handed to phase 4 as a sort manager.

use crate::encoding::square_to_line_point;
use crate::park::ParkBuilder;
use crate::phase2::Phase2Results;
use crate::plotter::{table_file_entry_size, PlotContext};
use crate::progress::ProgressCallback;
use orchard_common::bits::{slice_u128, slice_u64_full, BitWriter};
use orchard_common::constants::*;
use orchard_common::entry_sizes::{max_entry_size, park_size};
use orchard_common::{cdiv, PlotError, Result};
use orchard_disk::{BitfieldIndex, BufferedDisk, Disk, FileDisk, FilteredDisk};
use orchard_sort::{SortManager, SortStrategy};
use std::time::Instant;
use tracing::info;

/// Ring capacity for resolving references while joining; bounded by the
/// offset width plus slack.
const WINDOW: usize = 1 << 12;

/// Results handed to phase 4.
pub struct Phase3Results {
    /// Byte offsets of each final table's park stream; [1] is the header
    /// size, [8..10] are filled by phase 4, [11] is the end of file.
    pub final_table_begin_pointers: [u64; 12],
    /// Number of f7 entries carried into the checkpoint tables.
    pub final_entries_written: u64,
    /// Table 7 keyed by f7: entries of `f7 (k bits) ‖ pos (k+1 bits)`.
    pub table7_sm: SortManager,
}

/// The stream of table-t values consumed while resolving references.
///
/// Table 1's values are its surviving x's, read through the filtered view
/// (or the raw file when phase 2 already rewrote it); later tables' values
/// are the new keys assigned by the previous iteration, drained from the
/// renumbering sort in survivor order.
enum LeftValues {
    Filtered(FilteredDisk, u8),
    Raw(BufferedDisk, u8),
    Keys(SortManager, u8, usize),
}

impl LeftValues {
    fn value(&mut self, index: u64) -> Result<u64> {
        match self {
            LeftValues::Filtered(disk, k) => {
                let size = cdiv(*k as u32, 8) as u64;
                let entry = disk.read(index * size, size)?;
                Ok(slice_u64_full(entry, 0, *k as u32))
            }
            LeftValues::Raw(disk, k) => {
                let size = cdiv(*k as u32, 8) as u64;
                let entry = disk.read(index * size, size)?;
                Ok(slice_u64_full(entry, 0, *k as u32))
            }
            LeftValues::Keys(sm, k, entry_size) => {
                let entry = sm.read_entry(index * *entry_size as u64)?;
                Ok(slice_u64_full(entry, *k as u32, *k as u32))
            }
        }
    }
}

/// Runs phase 3, writing the park streams for tables 1..6 into the plot
/// file under construction.
pub fn run(
    ctx: &PlotContext,
    tmp2: &mut FileDisk,
    mut res2: Phase2Results,
    header_size: u32,
    progress: &ProgressCallback,
) -> Result<Phase3Results> {
    let k = ctx.k as u32;
    let mut pointers = [0u64; 12];
    pointers[1] = header_size as u64;

    // The renumbering sort produced by the previous iteration; None for
    // table 1, whose values are the x's themselves.
    let mut prev_keys: Option<SortManager> = None;
    let renumber_size = cdiv(2 * k, 8) as usize;
    let mut final_entries_written = 0u64;
    let mut table7_sm: Option<SortManager> = None;

    for t in 1..=6u8 {
        let start = Instant::now();
        let r = t + 1;
        let r_raw = res2.raw_table_sizes[r as usize];
        let r_file_entry_size = table_file_entry_size(ctx.k, r) as u64;
        let sorted_size = max_entry_size(ctx.k, r, false) as usize;
        let l_filter = res2.bitfields[t as usize].take();

        // Pass A: scan table t+1's survivors in f order; renumber their
        // references through the rank of table t's filter and key the
        // stream by the renumbered pos.
        let mut by_pos = SortManager::new(ctx.sort_config(
            4,
            t,
            sorted_size,
            k,
            SortStrategy::QuicksortLast,
        ))?;
        let r_count = {
            let l_index = l_filter.as_ref().map(BitfieldIndex::new);
            let file = FileDisk::open_existing(ctx.table_path(r), ctx.retry)?;
            let mut reader = BufferedDisk::new(file, r_raw * r_file_entry_size);
            let mut packer = BitWriter::new();
            let mut survivors = 0u64;
            for i in 0..r_raw {
                if let Some(filter) = &res2.bitfields[r as usize] {
                    if !filter.get(i) {
                        continue;
                    }
                }
                let entry = reader.read(i * r_file_entry_size, r_file_entry_size)?;
                let (f7, pos, offset) = if r == 7 {
                    (
                        slice_u64_full(entry, 0, k),
                        slice_u64_full(entry, k, k),
                        slice_u64_full(entry, 2 * k, K_OFFSET_SIZE),
                    )
                } else {
                    (
                        0,
                        slice_u64_full(entry, 0, k),
                        slice_u64_full(entry, k, K_OFFSET_SIZE),
                    )
                };
                let key = if r == 7 { f7 } else { survivors };
                let (new_pos, new_offset) = match (&l_index, &l_filter) {
                    (Some(index), Some(filter)) => {
                        let p = index.rank(filter, pos);
                        (p, index.rank(filter, pos + offset) - p)
                    }
                    _ => (pos, offset),
                };
                packer.clear();
                packer.push(key as u128, k);
                packer.push(new_pos as u128, k);
                packer.push(new_offset as u128, K_OFFSET_SIZE);
                packer.pad_to_byte();
                let mut bytes = packer.as_slice().to_vec();
                bytes.resize(sorted_size, 0);
                by_pos.add(&bytes)?;
                survivors += 1;
            }
            by_pos.flush()?;
            survivors
        };

        // Pass B: resolve each (pos, offset) to the two table-t values and
        // key the resulting line points.
        let mut by_lp = SortManager::new(ctx.sort_config(
            5,
            t,
            sorted_size,
            0,
            SortStrategy::QuicksortLast,
        ))?;
        {
            let mut left = if t == 1 {
                let file = FileDisk::open_existing(ctx.table_path(1), ctx.retry)?;
                let size = cdiv(k, 8) as u64;
                let buffered = BufferedDisk::new(file, res2.raw_table_sizes[1] * size);
                match l_filter {
                    Some(filter) => {
                        LeftValues::Filtered(FilteredDisk::new(buffered, filter, size), ctx.k)
                    }
                    None => LeftValues::Raw(buffered, ctx.k),
                }
            } else {
                let sm = prev_keys.take().ok_or_else(|| {
                    PlotError::Corruption("renumbering stream missing".to_string())
                })?;
                LeftValues::Keys(sm, ctx.k, renumber_size)
            };

            let mut vals = vec![0u64; WINDOW];
            let mut l_next = 0u64;
            let mut packer = BitWriter::new();
            for i in 0..r_count {
                let (key, new_pos, new_offset) = {
                    let entry = by_pos.read_entry(i * sorted_size as u64)?;
                    (
                        slice_u64_full(entry, 0, k),
                        slice_u64_full(entry, k, k),
                        slice_u64_full(entry, 2 * k, K_OFFSET_SIZE),
                    )
                };
                while l_next <= new_pos + new_offset {
                    vals[l_next as usize % WINDOW] = left.value(l_next)?;
                    l_next += 1;
                }
                let x = vals[new_pos as usize % WINDOW];
                let y = vals[(new_pos + new_offset) as usize % WINDOW];
                let lp = square_to_line_point(x, y);

                packer.clear();
                packer.push(lp, 2 * k - 1);
                packer.push(key as u128, k);
                packer.pad_to_byte();
                let mut bytes = packer.as_slice().to_vec();
                bytes.resize(sorted_size, 0);
                by_lp.add(&bytes)?;
            }
            by_lp.flush()?;
        }
        drop(by_pos);

        // Pass C: write parks in line-point order and assign each entry
        // its rank as the new key for the next iteration.
        {
            let park_bytes = park_size(ctx.k, t) as u64;
            let r_ans = if t == 1 {
                K_MAX_AVERAGE_DELTA_TABLE1
            } else {
                K_MAX_AVERAGE_DELTA
            };
            let codec = crate::encoding::AnsCodec::new(r_ans);
            let mut builder = ParkBuilder::new(ctx.k, t);
            let mut park_buf = Vec::new();
            let mut parks_written = 0u64;

            let mut next_keys = if t < 6 {
                Some(SortManager::new(ctx.sort_config(
                    6,
                    t,
                    renumber_size,
                    0,
                    SortStrategy::QuicksortLast,
                ))?)
            } else {
                None
            };
            let mut t7 = if t == 6 {
                Some(SortManager::new(ctx.sort_config(
                    7,
                    t,
                    cdiv(2 * k + 1, 8) as usize,
                    0,
                    SortStrategy::QuicksortLast,
                ))?)
            } else {
                None
            };

            let mut packer = BitWriter::new();
            for i in 0..r_count {
                let (lp, key) = {
                    let entry = by_lp.read_entry(i * sorted_size as u64)?;
                    (
                        slice_u128(entry, 0, 2 * k - 1),
                        slice_u64_full(entry, 2 * k - 1, k),
                    )
                };
                if builder.push(lp)? {
                    builder.flush(&codec, &mut park_buf)?;
                    tmp2.write(pointers[t as usize] + parks_written * park_bytes, &park_buf)?;
                    parks_written += 1;
                }
                packer.clear();
                if let Some(sm) = &mut next_keys {
                    packer.push(key as u128, k);
                    packer.push(i as u128, k);
                    packer.pad_to_byte();
                    let mut bytes = packer.as_slice().to_vec();
                    bytes.resize(renumber_size, 0);
                    sm.add(&bytes)?;
                } else if let Some(sm) = &mut t7 {
                    packer.push(key as u128, k);
                    packer.push(i as u128, k + 1);
                    packer.pad_to_byte();
                    let mut bytes = packer.as_slice().to_vec();
                    bytes.resize(cdiv(2 * k + 1, 8) as usize, 0);
                    sm.add(&bytes)?;
                }
            }
            if !builder.is_empty() {
                builder.flush(&codec, &mut park_buf)?;
                tmp2.write(pointers[t as usize] + parks_written * park_bytes, &park_buf)?;
                parks_written += 1;
            }
            pointers[t as usize + 1] = pointers[t as usize] + parks_written * park_bytes;

            if let Some(mut sm) = next_keys {
                sm.flush()?;
                prev_keys = Some(sm);
            }
            if let Some(mut sm) = t7 {
                sm.flush()?;
                final_entries_written = r_count;
                table7_sm = Some(sm);
            }
        }

        info!(
            "table {} compressed: {} entries in {:.2?}",
            t,
            r_count,
            start.elapsed()
        );
        progress(3, t as u64, 6);
    }

    let table7_sm = table7_sm.ok_or_else(|| {
        PlotError::Corruption("phase 3 finished without a table-7 stream".to_string())
    })?;
    Ok(Phase3Results {
        final_table_begin_pointers: pointers,
        final_entries_written,
        table7_sm,
    })
}
