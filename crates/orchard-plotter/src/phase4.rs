//! Phase 4: checkpoint tables.
//!
//! Drains table 7 in f7 order, writing the final table-7 position parks
//! (k + 1 bits per entry) and the three checkpoint levels over the f7
//! values: C1 samples every K_CHECKPOINT1_INTERVAL-th f7, C3 parks encode
//! the deltas inside each C1 interval, and C2 samples the C1 stream again
//! for in-memory use while proving. Finishes by patching the ten table
//! pointers into the header.

use crate::encoding::AnsCodec;
use crate::phase3::Phase3Results;
use crate::plotter::PlotContext;
use crate::progress::ProgressCallback;
use orchard_common::bits::{slice_u64_full, BitWriter};
use orchard_common::constants::*;
use orchard_common::entry_sizes::{c3_park_size, checkpoint_entry_size, p7_park_size};
use orchard_common::{cdiv, PlotError, Result};
use orchard_disk::FileDisk;
use std::time::Instant;
use tracing::info;

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Runs phase 4; returns the final plot size in bytes.
pub fn run(
    ctx: &PlotContext,
    tmp2: &mut FileDisk,
    res: &mut Phase3Results,
    header_size: u32,
    progress: &ProgressCallback,
) -> Result<u64> {
    let start = Instant::now();
    let k = ctx.k as u32;
    let n = res.final_entries_written;
    let entry_size = cdiv(2 * k + 1, 8) as u64;
    let pos_size = k + 1;

    let p7_size = p7_park_size(ctx.k) as u64;
    let p7_parks = div_ceil(n, K_ENTRIES_PER_PARK as u64);
    let cp_size = checkpoint_entry_size(ctx.k) as u64;
    let c3_size = c3_park_size(ctx.k) as u64;
    let interval = K_CHECKPOINT1_INTERVAL as u64;
    let total_c1 = div_ceil(n, interval);
    let total_c2 = div_ceil(total_c1, K_CHECKPOINT2_INTERVAL as u64);

    let pointers = &mut res.final_table_begin_pointers;
    pointers[8] = pointers[7] + p7_parks * p7_size;
    pointers[9] = pointers[8] + (total_c1 + 1) * cp_size;
    pointers[10] = pointers[9] + (total_c2 + 1) * cp_size;

    let codec = AnsCodec::new(K_C3_R);
    let mut p7 = BitWriter::with_capacity(p7_size as usize);
    let mut p7_written = 0u64;
    let mut c1_written = 0u64;
    let mut c2_values: Vec<u64> = Vec::new();
    let mut c3_written = 0u64;
    let mut deltas: Vec<u8> = Vec::new();
    let mut prev_f7 = 0u64;
    let mut cp = BitWriter::new();
    let progress_step = (n / 16).max(1);

    for i in 0..n {
        let (f7, pos) = {
            let entry = res.table7_sm.read_entry(i * entry_size)?;
            (
                slice_u64_full(entry, 0, k),
                slice_u64_full(entry, k, pos_size),
            )
        };

        p7.push(pos as u128, pos_size);
        if p7.bit_len() as u64 == pos_size as u64 * K_ENTRIES_PER_PARK as u64 {
            write_padded(tmp2, pointers[7] + p7_written * p7_size, &mut p7, p7_size)?;
            p7_written += 1;
        }

        if i % interval == 0 {
            cp.clear();
            cp.push(f7 as u128, k);
            cp.pad_to_byte();
            let mut bytes = cp.as_slice().to_vec();
            bytes.resize(cp_size as usize, 0);
            tmp2.write(pointers[8] + c1_written * cp_size, &bytes)?;
            if c1_written % K_CHECKPOINT2_INTERVAL as u64 == 0 {
                c2_values.push(f7);
            }
            c1_written += 1;

            if i > 0 {
                write_c3_park(tmp2, pointers[10] + c3_written * c3_size, &codec, &deltas, c3_size)?;
                c3_written += 1;
                deltas.clear();
            }
        } else {
            let delta = f7 - prev_f7;
            if delta > u8::MAX as u64 {
                return Err(PlotError::Corruption(format!(
                    "f7 delta {} exceeds the checkpoint encoding",
                    delta
                )));
            }
            deltas.push(delta as u8);
        }
        prev_f7 = f7;

        if i % progress_step == 0 {
            progress(4, i, n.max(1));
        }
    }

    if p7.bit_len() > 0 {
        write_padded(tmp2, pointers[7] + p7_written * p7_size, &mut p7, p7_size)?;
        p7_written += 1;
    }
    debug_assert_eq!(p7_written, p7_parks);

    if !deltas.is_empty() {
        write_c3_park(tmp2, pointers[10] + c3_written * c3_size, &codec, &deltas, c3_size)?;
        c3_written += 1;
    }

    // C1 and C2 each end with one zeroed entry.
    let zero = vec![0u8; cp_size as usize];
    tmp2.write(pointers[8] + c1_written * cp_size, &zero)?;
    for (j, f7) in c2_values.iter().enumerate() {
        cp.clear();
        cp.push(*f7 as u128, k);
        cp.pad_to_byte();
        let mut bytes = cp.as_slice().to_vec();
        bytes.resize(cp_size as usize, 0);
        tmp2.write(pointers[9] + j as u64 * cp_size, &bytes)?;
    }
    tmp2.write(pointers[9] + c2_values.len() as u64 * cp_size, &zero)?;

    pointers[11] = pointers[10] + c3_written * c3_size;

    // Patch the table pointers into the header.
    let mut pointer_block = Vec::with_capacity(80);
    for idx in 1..=10 {
        pointer_block.extend_from_slice(&pointers[idx].to_be_bytes());
    }
    tmp2.write(header_size as u64 - 80, &pointer_block)?;

    info!(
        "checkpoints written: {} C1, {} C2, {} C3 parks, {:.2?}",
        c1_written,
        c2_values.len(),
        c3_written,
        start.elapsed()
    );
    progress(4, n.max(1), n.max(1));
    Ok(pointers[11])
}

/// Pads the accumulated park bits to `size` bytes and writes them.
fn write_padded(tmp2: &mut FileDisk, at: u64, bits: &mut BitWriter, size: u64) -> Result<()> {
    bits.pad_to_byte();
    let mut bytes = bits.as_slice().to_vec();
    bytes.resize(size as usize, 0);
    tmp2.write(at, &bytes)?;
    bits.clear();
    Ok(())
}

/// Serializes one C3 park: little-endian length, coded deltas, padding.
fn write_c3_park(
    tmp2: &mut FileDisk,
    at: u64,
    codec: &AnsCodec,
    deltas: &[u8],
    c3_size: u64,
) -> Result<()> {
    let (encoded, raw) = match codec.encode(deltas) {
        Some(coded) if coded.len() < deltas.len() => (coded, false),
        _ => (deltas.to_vec(), true),
    };
    if encoded.len() + 2 > c3_size as usize {
        return Err(PlotError::Corruption(format!(
            "C3 park needs {} bytes but only {} fit",
            encoded.len() + 2,
            c3_size
        )));
    }
    let len_field =
        encoded.len() as u16 | if raw { crate::park::PARK_RAW_DELTAS_FLAG } else { 0 };
    let mut bytes = Vec::with_capacity(c3_size as usize);
    bytes.extend_from_slice(&len_field.to_le_bytes());
    bytes.extend_from_slice(&encoded);
    bytes.resize(c3_size as usize, 0);
    tmp2.write(at, &bytes)?;
    Ok(())
}

/// Reads one C3 park back into its deltas; used by read-back validation.
pub fn read_c3_park(codec: &AnsCodec, bytes: &[u8], count: usize) -> Result<Vec<u8>> {
    if bytes.len() < 2 {
        return Err(PlotError::Corruption("C3 park too small".to_string()));
    }
    let len_field = u16::from_le_bytes([bytes[0], bytes[1]]);
    let raw = len_field & crate::park::PARK_RAW_DELTAS_FLAG != 0;
    let len = (len_field & !crate::park::PARK_RAW_DELTAS_FLAG) as usize;
    if 2 + len > bytes.len() {
        return Err(PlotError::Corruption(
            "C3 delta block runs past its park".to_string(),
        ));
    }
    if raw {
        if len != count {
            return Err(PlotError::Corruption(format!(
                "raw C3 block holds {} deltas, expected {}",
                len, count
            )));
        }
        Ok(bytes[2..2 + len].to_vec())
    } else {
        codec.decode(&bytes[2..2 + len], count)
    }
}
