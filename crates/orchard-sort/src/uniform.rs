//! Distribution sort for uniformly keyed buckets.
//!
//! Each entry's slot is chosen by the high-order post-bucket bits of its
//! key, so a uniformly distributed bucket lands almost in order; collisions
//! linear-probe forward while keeping the run ordered. An all-zero run of
//! `entry_len` bytes marks an empty slot, which is why the caller must zero
//! the target memory and why entries are assumed non-zero (an all-zero
//! entry has probability 2^-(2k + 6)).

use orchard_common::bits::{extract_num, memcmp_bits};
use orchard_common::{PlotError, Result};
use orchard_disk::FileDisk;
use std::cmp::Ordering;

/// Chunk size for streaming the bucket file.
pub const BUF_SIZE: usize = 262144;

/// Memory entries required to sort `size` input entries: the next power of
/// two past twice the input, plus probe slack.
pub fn round_size(size: u64) -> u64 {
    let doubled = size * 2;
    let mut result = 1u64;
    while result < doubled {
        result *= 2;
    }
    result + 50
}

#[inline]
fn is_position_empty(memory: &[u8]) -> bool {
    memory.iter().all(|&b| b == 0)
}

/// Reads `num_entries` entries from `input_disk` at `input_disk_begin` and
/// leaves them sorted (from bit `bits_begin`) at the front of `memory`.
///
/// `memory` must hold at least `round_size(num_entries) * entry_len` zeroed
/// bytes; the caller checks that bound and falls back to quicksort when it
/// cannot be met.
pub fn sort_to_memory(
    input_disk: &mut FileDisk,
    input_disk_begin: u64,
    memory: &mut [u8],
    entry_len: usize,
    num_entries: u64,
    bits_begin: u32,
) -> Result<()> {
    if num_entries == 0 {
        return Ok(());
    }
    let memory_len = round_size(num_entries) * entry_len as u64;
    debug_assert!(memory.len() as u64 >= memory_len);
    memory[..memory_len as usize].fill(0);

    let mut bucket_length = 0u32;
    while (1u64 << bucket_length) < 2 * num_entries {
        bucket_length += 1;
    }

    let mut buffer = vec![0u8; BUF_SIZE + 7];
    let mut swap_space = vec![0u8; entry_len];
    let mut buf_entries = 0usize;
    let mut buf_ptr = 0usize;
    let mut read_pos = input_disk_begin;
    let mut remaining = num_entries;

    for _ in 0..num_entries {
        if buf_entries == 0 {
            buf_entries = (BUF_SIZE / entry_len).min(remaining as usize);
            let bytes = buf_entries * entry_len;
            input_disk.read(read_pos, &mut buffer[..bytes])?;
            read_pos += bytes as u64;
            buf_ptr = 0;
        }
        remaining -= 1;

        let slot = extract_num(&buffer[buf_ptr..], entry_len as u32, bits_begin, bucket_length);
        let mut pos = slot as usize * entry_len;
        // Probe forward; keep the collision run ordered by swapping the
        // carried entry whenever the resident one is larger.
        loop {
            if pos as u64 + entry_len as u64 > memory_len {
                return Err(PlotError::Corruption(
                    "uniform sort probed past its memory bound".to_string(),
                ));
            }
            if is_position_empty(&memory[pos..pos + entry_len]) {
                break;
            }
            if memcmp_bits(
                &memory[pos..pos + entry_len],
                &buffer[buf_ptr..buf_ptr + entry_len],
                entry_len,
                bits_begin,
            ) == Ordering::Greater
            {
                swap_space.copy_from_slice(&memory[pos..pos + entry_len]);
                memory[pos..pos + entry_len].copy_from_slice(&buffer[buf_ptr..buf_ptr + entry_len]);
                buffer[buf_ptr..buf_ptr + entry_len].copy_from_slice(&swap_space);
            }
            pos += entry_len;
        }
        memory[pos..pos + entry_len].copy_from_slice(&buffer[buf_ptr..buf_ptr + entry_len]);
        buf_ptr += entry_len;
        buf_entries -= 1;
    }

    // Compact the occupied slots to the front, preserving order.
    let mut entries_written = 0u64;
    let mut pos = 0usize;
    while entries_written < num_entries && (pos as u64) < memory_len {
        if !is_position_empty(&memory[pos..pos + entry_len]) {
            let dst = entries_written as usize * entry_len;
            memory.copy_within(pos..pos + entry_len, dst);
            entries_written += 1;
        }
        pos += entry_len;
    }
    if entries_written != num_entries {
        return Err(PlotError::Corruption(format!(
            "uniform sort compacted {} of {} entries",
            entries_written, num_entries
        )));
    }
    Ok(())
}
