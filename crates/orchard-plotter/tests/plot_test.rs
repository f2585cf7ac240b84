//! End-to-end plot construction tests.
//!
//! These build real k = 18 plots through all four phases and check the
//! format invariants a consumer depends on: header layout, table pointer
//! monotonicity, park decodability, checkpoint consistency, and the
//! determinism guarantees (same inputs, any bucket count, either
//! back-propagation variant: byte-identical output).

use orchard_common::config::{PlotterConfig, RetryPolicy};
use orchard_common::constants::*;
use orchard_common::entry_sizes::{c3_park_size, checkpoint_entry_size, park_size};
use orchard_plotter::encoding::AnsCodec;
use orchard_plotter::park::decode_park;
use orchard_plotter::phase4::read_c3_park;
use orchard_plotter::progress::progress_none;
use orchard_plotter::DiskPlotter;
use std::sync::OnceLock;

const K: u8 = 18;
const TEST_ID: [u8; K_ID_LEN] = [0xab; K_ID_LEN];
const OTHER_ID: [u8; K_ID_LEN] = [0x11; K_ID_LEN];
const MEMO: &[u8] = b"integration test memo";

fn test_config() -> PlotterConfig {
    PlotterConfig {
        buf_megabytes: 32,
        num_buckets: 0,
        stripe_size: 2048,
        num_threads: 2,
        no_bitfield: false,
        retry: RetryPolicy::immediate(),
    }
}

fn make_plot(id: &[u8; K_ID_LEN], config: &PlotterConfig) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let plotter = DiskPlotter::new();
    let path = plotter
        .create_plot_disk(
            dir.path(),
            dir.path(),
            dir.path(),
            "test.plot",
            K,
            MEMO,
            id,
            config,
            &progress_none,
        )
        .unwrap();
    let bytes = std::fs::read(&path).unwrap();

    // Temporary files are gone; only the plot remains.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path() != path)
        .collect();
    assert!(leftovers.is_empty(), "temp files leaked: {:?}", leftovers);
    bytes
}

/// The reference plot, built once and shared across tests.
fn base_plot() -> &'static Vec<u8> {
    static PLOT: OnceLock<Vec<u8>> = OnceLock::new();
    PLOT.get_or_init(|| make_plot(&TEST_ID, &test_config()))
}

fn header_size() -> usize {
    19 + 32 + 1 + 2 + K_FORMAT_DESCRIPTION.len() + 2 + MEMO.len() + 80
}

/// Reads pointers[1..=10] from the header's trailing pointer block.
fn read_pointers(plot: &[u8]) -> [u64; 11] {
    let base = header_size() - 80;
    let mut pointers = [0u64; 11];
    for i in 1..=10 {
        let off = base + (i - 1) * 8;
        pointers[i] = u64::from_be_bytes(plot[off..off + 8].try_into().unwrap());
    }
    pointers
}

#[test]
fn test_header_fields() {
    let plot = base_plot();
    assert_eq!(&plot[..19], b"Proof of Space Plot");
    assert_eq!(&plot[19..51], &TEST_ID);
    assert_eq!(plot[51], K);
    assert_eq!(
        u16::from_be_bytes([plot[52], plot[53]]) as usize,
        K_FORMAT_DESCRIPTION.len()
    );
    let fmt_end = 54 + K_FORMAT_DESCRIPTION.len();
    assert_eq!(&plot[54..fmt_end], K_FORMAT_DESCRIPTION.as_bytes());
    assert_eq!(
        u16::from_be_bytes([plot[fmt_end], plot[fmt_end + 1]]) as usize,
        MEMO.len()
    );
    assert_eq!(&plot[fmt_end + 2..fmt_end + 2 + MEMO.len()], MEMO);
}

#[test]
fn test_table_pointers_monotone() {
    let plot = base_plot();
    let pointers = read_pointers(plot);
    assert_eq!(pointers[1] as usize, header_size());
    for i in 1..10 {
        assert!(
            pointers[i] < pointers[i + 1],
            "pointer {} = {} not below pointer {} = {}",
            i,
            pointers[i],
            i + 1,
            pointers[i + 1]
        );
    }
    assert!(pointers[10] < plot.len() as u64);

    // Each compressed table holds a whole number of parks.
    for t in 1..=6u8 {
        let span = pointers[t as usize + 1] - pointers[t as usize];
        assert_eq!(span % park_size(K, t) as u64, 0, "table {} misaligned", t);
        assert!(span > 0);
    }
}

#[test]
fn test_first_park_decodes_increasing_line_points() {
    let plot = base_plot();
    let pointers = read_pointers(plot);
    for (t, r) in [(1u8, K_MAX_AVERAGE_DELTA_TABLE1), (2, K_MAX_AVERAGE_DELTA)] {
        let codec = AnsCodec::new(r);
        let start = pointers[t as usize] as usize;
        let bytes = &plot[start..start + park_size(K, t) as usize];
        // Tables at k = 18 hold far more than one park, so the first park
        // is full.
        let lps = decode_park(K, t, &codec, bytes, K_ENTRIES_PER_PARK as usize).unwrap();
        assert_eq!(lps.len(), K_ENTRIES_PER_PARK as usize);
        for pair in lps.windows(2) {
            assert!(pair[0] < pair[1], "line points not strictly increasing");
        }
    }
}

#[test]
fn test_checkpoints_consistent() {
    let plot = base_plot();
    let pointers = read_pointers(plot);
    let cp = checkpoint_entry_size(K) as usize;

    // C1 region: total entries plus one zero terminator.
    let c1_region = (pointers[9] - pointers[8]) as usize;
    assert_eq!(c1_region % cp, 0);
    let total_c1 = c1_region / cp - 1;
    assert!(total_c1 >= 2, "k = 18 yields several C1 intervals");

    let read_cp = |at: usize| -> u64 {
        let mut v = 0u64;
        for i in 0..cp {
            v = (v << 8) | plot[at + i] as u64;
        }
        v >> (cp * 8 - K as usize)
    };

    let mut c1_values = Vec::with_capacity(total_c1);
    for i in 0..total_c1 {
        c1_values.push(read_cp(pointers[8] as usize + i * cp));
    }
    for pair in c1_values.windows(2) {
        assert!(pair[0] <= pair[1], "C1 checkpoints must be sorted");
    }

    // C2 samples the C1 stream; at this size there is exactly one, equal
    // to the first C1.
    let c2_region = (pointers[10] - pointers[9]) as usize;
    let total_c2 = c2_region / cp - 1;
    assert_eq!(total_c2, 1);
    assert_eq!(read_cp(pointers[9] as usize), c1_values[0]);

    // One C3 park per C1 interval; the first one decodes to a full
    // interval of deltas that stays below the next checkpoint.
    let c3 = c3_park_size(K) as usize;
    let c3_region = plot.len() - pointers[10] as usize;
    assert_eq!(c3_region % c3, 0);
    assert_eq!(c3_region / c3, total_c1);

    let codec = AnsCodec::new(K_C3_R);
    let first_park = &plot[pointers[10] as usize..pointers[10] as usize + c3];
    let deltas =
        read_c3_park(&codec, first_park, K_CHECKPOINT1_INTERVAL as usize - 1).unwrap();
    let reconstructed = c1_values[0] + deltas.iter().map(|&d| d as u64).sum::<u64>();
    assert!(reconstructed <= c1_values[1]);
}

#[test]
fn test_same_inputs_reproduce_identical_bytes() {
    let again = make_plot(&TEST_ID, &test_config());
    assert_eq!(base_plot(), &again);
}

#[test]
fn test_no_bitfield_variant_is_byte_identical() {
    let config = PlotterConfig {
        no_bitfield: true,
        ..test_config()
    };
    let rewritten = make_plot(&TEST_ID, &config);
    assert_eq!(base_plot(), &rewritten);
}

#[test]
fn test_bucket_count_does_not_change_bytes() {
    let config = PlotterConfig {
        num_buckets: 64,
        ..test_config()
    };
    let other = make_plot(&TEST_ID, &config);
    assert_eq!(base_plot(), &other);
}

#[test]
fn test_different_ids_diverge() {
    let other = make_plot(&OTHER_ID, &test_config());
    let base = base_plot();
    assert_eq!(&other[..19], &base[..19], "magic is id-independent");
    assert_ne!(&other[19..51], &base[19..51]);

    // Table contents diverge immediately after the shared header shape.
    let pointers = read_pointers(base);
    let start = pointers[1] as usize;
    assert_ne!(
        &other[start..start + 64],
        &base[start..start + 64],
        "first park should differ between ids"
    );
}
