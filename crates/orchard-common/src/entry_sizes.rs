//! Entry and park size arithmetic.
//!
//! All on-disk records are bit-packed and then byte-aligned. These helpers
//! centralize the width formulas so every phase agrees on layout. The sizes
//! returned here are what a table will need at its widest point, which lets
//! later phases rewrite tables on top of themselves.

use crate::constants::*;
use crate::{byte_align, cdiv};

/// The largest entry size table `table_index` will have during plotting.
///
/// `phase_1` selects between the wide phase-1 representation (with f value
/// and metadata) and the narrower phase-2/3 representation.
pub fn max_entry_size(k: u8, table_index: u8, phase_1: bool) -> u32 {
    let k = k as u32;
    match table_index {
        1 => {
            if phase_1 {
                // f1, x
                byte_align(k + K_EXTRA_BITS + k) / 8
            } else {
                // Matching done; f1 is dropped and only x remains.
                byte_align(k) / 8
            }
        }
        2..=6 => {
            if phase_1 {
                // f, pos, offset, metadata
                byte_align(k + K_EXTRA_BITS + k + K_OFFSET_SIZE + k * K_VECTOR_LENS[table_index as usize + 1])
                    / 8
            } else {
                // Either (sort_key, pos, offset) or (line_point, sort_key).
                byte_align((2 * k + K_OFFSET_SIZE).max(3 * k - 1)) / 8
            }
        }
        _ => {
            // line_point, f7
            byte_align(3 * k - 1) / 8
        }
    }
}

/// Size of a (sort_key, pos, offset) record.
pub fn key_pos_offset_size(k: u8) -> u32 {
    cdiv(2 * k as u32 + K_OFFSET_SIZE, 8)
}

/// Size of a park's anchor line point.
pub fn line_point_size(k: u8) -> u32 {
    byte_align(2 * k as u32) / 8
}

/// Size of a park's stub section.
pub fn stubs_size(k: u8) -> u32 {
    byte_align((K_ENTRIES_PER_PARK - 1) * (k as u32 - K_STUB_MINUS_BITS)) / 8
}

/// Maximum size of a park's encoded delta section.
///
/// The float product truncates to a bit count before aligning, matching the
/// original format arithmetic exactly.
pub fn max_deltas_size(k: u8, table_index: u8) -> u32 {
    let _ = k;
    let r = if table_index == 1 {
        K_MAX_AVERAGE_DELTA_TABLE1
    } else {
        K_MAX_AVERAGE_DELTA
    };
    byte_align(((K_ENTRIES_PER_PARK - 1) as f64 * r) as u32) / 8
}

/// Total fixed park size for the given table.
pub fn park_size(k: u8, table_index: u8) -> u32 {
    line_point_size(k) + stubs_size(k) + max_deltas_size(k, table_index)
}

/// Fixed size of a C3 checkpoint park.
pub fn c3_park_size(k: u8) -> u32 {
    if k < 20 {
        byte_align(8 * K_CHECKPOINT1_INTERVAL) / 8
    } else {
        byte_align((K_C3_BITS_PER_ENTRY * K_CHECKPOINT1_INTERVAL as f64) as u32) / 8
    }
}

/// Fixed size of a final table-7 position park: K_ENTRIES_PER_PARK entries
/// of k + 1 bits each.
pub fn p7_park_size(k: u8) -> u32 {
    byte_align((k as u32 + 1) * K_ENTRIES_PER_PARK) / 8
}

/// Size of a C1/C2 checkpoint entry.
pub fn checkpoint_entry_size(k: u8) -> u32 {
    byte_align(k as u32) / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_entry_size_table1() {
        // k = 18: f1 (24 bits) + x (18 bits) = 42 bits -> 6 bytes.
        assert_eq!(max_entry_size(18, 1, true), 6);
        // After phase 1 only x remains: 18 bits -> 3 bytes.
        assert_eq!(max_entry_size(18, 1, false), 3);
    }

    #[test]
    fn test_max_entry_size_middle_tables() {
        // k = 18, table 2: 24 + 18 + 10 + 18 * 2 = 88 bits -> 11 bytes.
        assert_eq!(max_entry_size(18, 2, true), 11);
        // k = 18, table 3: 24 + 18 + 10 + 18 * 4 = 124 bits -> 16 bytes.
        assert_eq!(max_entry_size(18, 3, true), 16);
        // Post-phase-1: max(2k + 10, 3k - 1) = max(46, 53) = 53 -> 7 bytes.
        assert_eq!(max_entry_size(18, 4, false), 7);
    }

    #[test]
    fn test_max_entry_size_table7() {
        // 3 * 18 - 1 = 53 bits -> 7 bytes.
        assert_eq!(max_entry_size(18, 7, true), 7);
        assert_eq!(max_entry_size(18, 7, false), 7);
    }

    #[test]
    fn test_entry_sizes_monotone_in_k() {
        for t in 1..=7u8 {
            for k in K_MIN_PLOT_SIZE..K_MAX_PLOT_SIZE {
                assert!(max_entry_size(k + 1, t, true) >= max_entry_size(k, t, true));
                assert!(max_entry_size(k + 1, t, false) >= max_entry_size(k, t, false));
            }
        }
    }

    #[test]
    fn test_park_size_components() {
        let k = 18;
        // Anchor: 36 bits -> 5 bytes.
        assert_eq!(line_point_size(k), 5);
        // Stubs: 2047 * 16 = 32752 bits -> 4094 bytes.
        assert_eq!(stubs_size(k), 4094);
        // Deltas, table 1: trunc(2047 * 5.6) = 11463 bits -> 1433 bytes.
        assert_eq!(max_deltas_size(k, 1), 1433);
        // Deltas, other tables: trunc(2047 * 4.4) = 9006 bits -> 1126 bytes.
        assert_eq!(max_deltas_size(k, 2), 1126);
        assert_eq!(park_size(k, 1), 5 + 4094 + 1433);
        assert_eq!(park_size(k, 6), 5 + 4094 + 1126);
    }

    #[test]
    fn test_c3_park_size() {
        // k < 20 uses one byte per interval entry.
        assert_eq!(c3_park_size(18), K_CHECKPOINT1_INTERVAL);
        // k >= 20 uses the compressed estimate: 24000 bits -> 3000 bytes.
        assert_eq!(c3_park_size(32), 3000);
    }

    #[test]
    fn test_p7_park_size() {
        // k = 18: 19 * 2048 = 38912 bits -> 4864 bytes.
        assert_eq!(p7_park_size(18), 4864);
    }

    #[test]
    fn test_key_pos_offset_size() {
        assert_eq!(key_pos_offset_size(18), 6); // 46 bits
        assert_eq!(key_pos_offset_size(32), 10); // 74 bits
    }

    #[test]
    fn test_checkpoint_entry_size() {
        assert_eq!(checkpoint_entry_size(18), 3);
        assert_eq!(checkpoint_entry_size(32), 4);
    }
}
