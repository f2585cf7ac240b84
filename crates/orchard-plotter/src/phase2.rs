//! Phase 2: back-propagation.
//!
//! Walks tables 7 down to 2 and prunes every entry no table-7 output can
//! reach. The bitfield variant only marks survivors, leaving the files
//! untouched for phase 3 to read through filtered views; the rewrite
//! variant physically drops dead entries and renumbers positions in place,
//! at the cost of two extra sorts per table. Both produce the same logical
//! streams, and therefore byte-identical plots.

use crate::plotter::{table_file_entry_size, PlotContext};
use crate::progress::ProgressCallback;
use orchard_common::bits::{slice_u64_full, BitWriter};
use orchard_common::constants::*;
use orchard_common::{cdiv, PlotError, Result};
use orchard_disk::{Bitfield, BufferedDisk, Disk, FileDisk};
use orchard_sort::{SortManager, SortStrategy};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::info;

/// What phase 2 hands to phase 3.
pub struct Phase2Results {
    /// Surviving entries per table (index = table number).
    pub table_sizes: [u64; 8],
    /// Entries physically present in each table file (pre-prune counts in
    /// the bitfield variant, post-prune in the rewrite variant).
    pub raw_table_sizes: [u64; 8],
    /// Per-table survivor filters, indexed by table number; `None` means
    /// every file entry is live.
    pub bitfields: [Option<Bitfield>; 8],
}

/// Runs phase 2 with the selected variant.
pub fn run(
    ctx: &PlotContext,
    table_sizes: &[u64; 8],
    no_bitfield: bool,
    progress: &ProgressCallback,
) -> Result<Phase2Results> {
    if no_bitfield {
        run_rewrite(ctx, table_sizes, progress)
    } else {
        run_bitfield(ctx, table_sizes, progress)
    }
}

/// Reads `(pos, offset)` from a table file entry.
fn read_pos_offset(entry: &[u8], k: u32, table_index: u8) -> (u64, u64) {
    if table_index == 7 {
        (
            slice_u64_full(entry, k, k),
            slice_u64_full(entry, 2 * k, K_OFFSET_SIZE),
        )
    } else {
        (
            slice_u64_full(entry, 0, k),
            slice_u64_full(entry, k, K_OFFSET_SIZE),
        )
    }
}

/// Marks reachable entries without rewriting anything.
fn run_bitfield(
    ctx: &PlotContext,
    table_sizes: &[u64; 8],
    progress: &ProgressCallback,
) -> Result<Phase2Results> {
    let k = ctx.k as u32;
    let mut bitfields: [Option<Bitfield>; 8] = std::array::from_fn(|_| None);
    let mut new_sizes = *table_sizes;

    for t in (2..=7u8).rev() {
        let start = Instant::now();
        let prev_len = table_sizes[t as usize - 1];
        let mut next = Bitfield::new(prev_len);

        let entry_size = table_file_entry_size(ctx.k, t) as u64;
        let file = FileDisk::open_existing(ctx.table_path(t), ctx.retry)?;
        let mut disk = BufferedDisk::new(file, table_sizes[t as usize] * entry_size);

        for i in 0..table_sizes[t as usize] {
            let live = match &bitfields[t as usize] {
                _ if t == 7 => true,
                Some(filter) => filter.get(i),
                None => true,
            };
            if !live {
                continue;
            }
            let entry = disk.read(i * entry_size, entry_size)?;
            let (pos, offset) = read_pos_offset(entry, k, t);
            if pos + offset >= prev_len {
                return Err(PlotError::Corruption(format!(
                    "table {} entry {} points past table {} ({} + {})",
                    t,
                    i,
                    t - 1,
                    pos,
                    offset
                )));
            }
            next.set(pos);
            next.set(pos + offset);
        }

        new_sizes[t as usize - 1] = next.count(0, prev_len);
        info!(
            "table {} scanned: {} of {} previous entries survive, {:.2?}",
            t,
            new_sizes[t as usize - 1],
            prev_len,
            start.elapsed()
        );
        bitfields[t as usize - 1] = Some(next);
        progress(2, 8 - t as u64, 6);
    }

    Ok(Phase2Results {
        table_sizes: new_sizes,
        raw_table_sizes: *table_sizes,
        bitfields,
    })
}

/// An entry of table t waiting for its references to be renumbered.
struct PendingEntry {
    key: u64,
    f7: u64,
    pos: u64,
    offset: u64,
}

/// Sliding co-scan state for the rewrite variant's pass over table t-1.
///
/// References from table t reach at most 2^K_OFFSET_SIZE entries ahead of
/// the pos currently streaming by, so a fixed ring of marks and assigned
/// ids is enough to prune and renumber in one pass.
struct Renumberer {
    marks: Vec<bool>,
    ids: Vec<u64>,
    pending: VecDeque<PendingEntry>,
    frontier: u64,
    survivors: u64,
    prev_entry_size: u64,
    sorted_size: usize,
    k: u32,
    has_f7: bool,
}

/// Ring capacity; one offset span plus generous slack.
const WINDOW: usize = 1 << 12;

impl Renumberer {
    fn new(prev_entry_size: u64, sorted_size: usize, k: u32, has_f7: bool) -> Self {
        Self {
            marks: vec![false; WINDOW],
            ids: vec![0u64; WINDOW],
            pending: VecDeque::new(),
            frontier: 0,
            survivors: 0,
            prev_entry_size,
            sorted_size,
            k,
            has_f7,
        }
    }

    /// Finalizes table t-1 indices below `to`, copying survivors forward
    /// and emitting every pending table-t entry whose references resolve.
    fn advance(
        &mut self,
        to: u64,
        prev_reader: &mut BufferedDisk,
        prev_writer: &mut BufferedDisk,
        by_key: &mut SortManager,
        packer: &mut BitWriter,
    ) -> Result<()> {
        while self.frontier < to {
            let j = self.frontier;
            let slot = j as usize % WINDOW;
            if self.marks[slot] {
                self.marks[slot] = false;
                let owned = {
                    let bytes = prev_reader.read(j * self.prev_entry_size, self.prev_entry_size)?;
                    bytes.to_vec()
                };
                prev_writer.write(self.survivors * self.prev_entry_size, &owned)?;
                self.ids[slot] = self.survivors;
                self.survivors += 1;
            }
            self.frontier += 1;

            while self
                .pending
                .front()
                .map_or(false, |f| f.pos + f.offset < self.frontier)
            {
                if let Some(e) = self.pending.pop_front() {
                    let new_pos = self.ids[e.pos as usize % WINDOW];
                    let new_offset = self.ids[(e.pos + e.offset) as usize % WINDOW] - new_pos;
                    packer.clear();
                    packer.push(e.key as u128, self.k);
                    if self.has_f7 {
                        packer.push(e.f7 as u128, self.k);
                    }
                    packer.push(new_pos as u128, self.k);
                    packer.push(new_offset as u128, K_OFFSET_SIZE);
                    packer.pad_to_byte();
                    by_key.add(&pad_entry(packer.as_slice(), self.sorted_size))?;
                }
            }
        }
        Ok(())
    }
}

/// Prunes and renumbers by rewriting the files, without any bitfield.
///
/// Per table t: (a) sort t by pos, carrying each entry's original index as
/// its sort key (table 7 also carries f7); (b) co-scan with table t-1,
/// drop unreferenced previous entries and assign dense ids; (c) restore
/// t's original order with a second sort on the key while rewriting
/// pos/offset through the new ids.
fn run_rewrite(
    ctx: &PlotContext,
    table_sizes: &[u64; 8],
    progress: &ProgressCallback,
) -> Result<Phase2Results> {
    let k = ctx.k as u32;
    let mut sizes = *table_sizes;

    for t in (2..=7u8).rev() {
        let start = Instant::now();
        let t_len = sizes[t as usize];
        let prev_len = sizes[t as usize - 1];
        let entry_size = table_file_entry_size(ctx.k, t) as u64;
        let prev_entry_size = table_file_entry_size(ctx.k, t - 1) as u64;

        // Sorted-entry layout: key ‖ [f7 ‖] pos ‖ offset.
        let has_f7 = t == 7;
        let sorted_size = phase2_sorted_entry_size(ctx.k, t);
        let pos_bit = if has_f7 { 2 * k } else { k };

        // Pass A: key table t by pos.
        let mut by_pos = SortManager::new(ctx.sort_config(
            2,
            t,
            sorted_size,
            pos_bit,
            SortStrategy::QuicksortLast,
        ))?;
        {
            let file = FileDisk::open_existing(ctx.table_path(t), ctx.retry)?;
            let mut disk = BufferedDisk::new(file, t_len * entry_size);
            let mut packer = BitWriter::new();
            for i in 0..t_len {
                let entry = disk.read(i * entry_size, entry_size)?;
                let (pos, offset) = read_pos_offset(entry, k, t);
                let f7 = if has_f7 { slice_u64_full(entry, 0, k) } else { 0 };
                packer.clear();
                packer.push(i as u128, k);
                if has_f7 {
                    packer.push(f7 as u128, k);
                }
                packer.push(pos as u128, k);
                packer.push(offset as u128, K_OFFSET_SIZE);
                packer.pad_to_byte();
                by_pos.add(&pad_entry(packer.as_slice(), sorted_size))?;
            }
            by_pos.flush()?;
        }

        // Pass B: co-scan table t-1, prune, renumber.
        let mut by_key = SortManager::new(ctx.sort_config(
            3,
            t,
            sorted_size,
            0,
            SortStrategy::QuicksortLast,
        ))?;
        {
            let prev_file = FileDisk::open_existing(ctx.table_path(t - 1), ctx.retry)?;
            let mut prev_reader = BufferedDisk::new(prev_file, prev_len * prev_entry_size);
            let mut prev_writer = BufferedDisk::new(
                FileDisk::open_existing(ctx.table_path(t - 1), ctx.retry)?,
                prev_len * prev_entry_size,
            );
            let mut packer = BitWriter::new();
            let mut ren = Renumberer::new(prev_entry_size, sorted_size, k, has_f7);

            for i in 0..t_len {
                let (key, f7, pos, offset) = {
                    let entry = by_pos.read_entry(i * sorted_size as u64)?;
                    (
                        slice_u64_full(entry, 0, k),
                        if has_f7 { slice_u64_full(entry, k, k) } else { 0 },
                        slice_u64_full(entry, pos_bit, k),
                        slice_u64_full(entry, pos_bit + k, K_OFFSET_SIZE),
                    )
                };
                if pos + offset >= prev_len {
                    return Err(PlotError::Corruption(format!(
                        "table {} references entry {} beyond table {}",
                        t,
                        pos + offset,
                        t - 1
                    )));
                }
                ren.advance(pos, &mut prev_reader, &mut prev_writer, &mut by_key, &mut packer)?;
                ren.marks[pos as usize % WINDOW] = true;
                ren.marks[(pos + offset) as usize % WINDOW] = true;
                ren.pending.push_back(PendingEntry { key, f7, pos, offset });
            }
            ren.advance(
                prev_len,
                &mut prev_reader,
                &mut prev_writer,
                &mut by_key,
                &mut packer,
            )?;
            if let Some(stuck) = ren.pending.front() {
                return Err(PlotError::Corruption(format!(
                    "entry referencing {} never resolved during back-propagation",
                    stuck.pos + stuck.offset
                )));
            }

            prev_writer.flush_cache()?;
            let mut prev_file = prev_writer.into_inner()?;
            prev_file.truncate(ren.survivors * prev_entry_size)?;
            sizes[t as usize - 1] = ren.survivors;
            by_key.flush()?;
        }
        drop(by_pos);

        // Pass C: restore original order and rewrite the table file.
        {
            let out_size = table_file_entry_size(ctx.k, t) as usize;
            let file = FileDisk::new(ctx.table_path(t), ctx.retry)?;
            let mut out = BufferedDisk::new(file, 0);
            let mut packer = BitWriter::new();
            for i in 0..t_len {
                let (f7, new_pos, new_offset) = {
                    let entry = by_key.read_entry(i * sorted_size as u64)?;
                    (
                        if has_f7 { slice_u64_full(entry, k, k) } else { 0 },
                        slice_u64_full(entry, pos_bit, k),
                        slice_u64_full(entry, pos_bit + k, K_OFFSET_SIZE),
                    )
                };
                packer.clear();
                if has_f7 {
                    packer.push(f7 as u128, k);
                }
                packer.push(new_pos as u128, k);
                packer.push(new_offset as u128, K_OFFSET_SIZE);
                packer.pad_to_byte();
                out.write(i * out_size as u64, &pad_entry(packer.as_slice(), out_size))?;
            }
            out.flush_cache()?;
        }

        info!(
            "table {} rewritten: {} of {} previous entries survive, {:.2?}",
            t,
            sizes[t as usize - 1],
            prev_len,
            start.elapsed()
        );
        progress(2, 8 - t as u64, 6);
    }

    Ok(Phase2Results {
        table_sizes: sizes,
        raw_table_sizes: sizes,
        bitfields: std::array::from_fn(|_| None),
    })
}

/// Zero-pads a packed entry to its on-disk size.
fn pad_entry(bytes: &[u8], size: usize) -> Vec<u8> {
    let mut v = Vec::with_capacity(size);
    v.extend_from_slice(bytes);
    v.resize(size, 0);
    v
}

/// Size of the keyed intermediate entries the rewrite variant sorts.
pub fn phase2_sorted_entry_size(k: u8, table_index: u8) -> usize {
    let k = k as u32;
    if table_index == 7 {
        cdiv(3 * k + K_OFFSET_SIZE, 8) as usize
    } else {
        cdiv(2 * k + K_OFFSET_SIZE, 8) as usize
    }
}
