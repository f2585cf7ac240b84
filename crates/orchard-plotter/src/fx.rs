//! The f1 / Fx oracles and the matching predicate.
//!
//! These are the plotter's external collaborators: the pipeline only
//! depends on their signatures. f1 slices a ChaCha8 keystream seeded by the
//! plot id; f2..f7 mix matched pairs through Blake2b. Matching pairs come
//! from adjacent K_BC-buckets of the y space, with 64 (m, parity) targets
//! per left entry.

use blake2::{Blake2b512, Digest};
use orchard_common::bits::{slice_u64_full, BitWriter};
use orchard_common::cdiv;
use orchard_common::constants::*;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Opaque entry metadata: up to 4k bits (256 at the largest k).
///
/// Metadata never needs integer interpretation, only concatenation and
/// re-packing, so it stays a big-endian bit string aligned to bit 0.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    buf: [u8; 32],
    bits: u32,
}

impl Meta {
    /// The empty metadata (table 7 entries carry none).
    pub fn empty() -> Self {
        Self {
            buf: [0u8; 32],
            bits: 0,
        }
    }

    /// Copies `len_bits` bits of `src` starting at `start_bit`.
    pub fn from_slice(src: &[u8], start_bit: u32, len_bits: u32) -> Self {
        debug_assert!(len_bits <= 256);
        let mut buf = [0u8; 32];
        let mut written = 0u32;
        while written < len_bits {
            let take = (len_bits - written).min(8);
            let v = (slice_u64_full(src, start_bit + written, take) as u8) << (8 - take);
            buf[(written / 8) as usize] = v;
            written += take;
        }
        Self { buf, bits: len_bits }
    }

    /// Metadata holding one k-bit value (a table-1 x).
    pub fn from_u64(value: u64, bits: u32) -> Self {
        let mut w = BitWriter::with_capacity(9);
        w.push(value as u128, bits);
        let bytes = w.into_padded();
        Self::from_slice(&bytes, 0, bits)
    }

    /// `left` followed by `right`.
    pub fn concat(left: &Meta, right: &Meta) -> Self {
        let mut w = BitWriter::with_capacity(64);
        left.append_to(&mut w);
        right.append_to(&mut w);
        let bytes = w.into_padded();
        Self::from_slice(&bytes, 0, left.bits + right.bits)
    }

    /// Appends this metadata to a bit cursor.
    pub fn append_to(&self, w: &mut BitWriter) {
        w.copy_bits(&self.buf, 0, self.bits);
    }

    /// Length in bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }
}

/// Streams f1 values from the ChaCha8 keystream seeded by the plot id.
///
/// `f1(x)` is the k-bit big-endian slice at bit `x * k` of the stream; the
/// published y additionally folds the top K_EXTRA_BITS bits of x into its
/// low bits.
pub struct F1Generator {
    k: u8,
    id: [u8; K_ID_LEN],
}

impl F1Generator {
    pub fn new(k: u8, id: &[u8; K_ID_LEN]) -> Self {
        Self { k, id: *id }
    }

    /// Computes `(y, x)` for `x in [x_start, x_start + count)`.
    pub fn generate(&self, x_start: u64, count: u64) -> Vec<(u64, u64)> {
        let k = self.k as u32;
        if count == 0 {
            return Vec::new();
        }
        let first_bit = x_start * k as u64;
        let last_bit = (x_start + count) * k as u64;
        // The keystream is positioned in 32-bit words.
        let first_word = first_bit / 32;
        let byte_base = first_word * 4;
        let n_bytes = (cdiv_u64(last_bit, 8) - byte_base) as usize + 8;

        let mut rng = ChaCha8Rng::from_seed(self.id);
        rng.set_word_pos(first_word as u128);
        let mut stream = vec![0u8; n_bytes];
        rng.fill_bytes(&mut stream);

        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let x = x_start + i;
            let bit = (x * k as u64 - byte_base * 8) as u32;
            let f1 = slice_u64_full(&stream, bit, k);
            let y = (f1 << K_EXTRA_BITS) | (x >> (k - K_EXTRA_BITS));
            out.push((y, x));
        }
        out
    }
}

fn cdiv_u64(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[derive(Debug, Clone, Copy, Default)]
struct RmapSlot {
    count: u16,
    start: u16,
}

/// Finds matching pairs between two adjacent y-buckets.
///
/// A pair (yl, yr) with `yr / K_BC == yl / K_BC + 1` matches iff for some
/// m in [0, 64): `br ≡ bl + m (mod K_B)` and
/// `cr ≡ cl + (2m + parity)^2 (mod K_C)`, where `y mod K_BC = b * K_C + c`
/// and parity is the left bucket's. The right bucket is indexed by
/// `y mod K_BC` so each left entry probes its 64 targets directly.
pub struct Matcher {
    rmap: Vec<RmapSlot>,
    rmap_clean: Vec<u16>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            rmap: vec![RmapSlot::default(); K_BC as usize],
            rmap_clean: Vec::new(),
        }
    }

    /// Appends `(left_index, right_index)` pairs to `out`.
    ///
    /// `left_ys` must all lie in one bucket and `right_ys` (sorted
    /// ascending) in the next one up.
    pub fn find_matches(&mut self, left_ys: &[u64], right_ys: &[u64], out: &mut Vec<(u16, u16)>) {
        debug_assert!(left_ys.len() <= u16::MAX as usize);
        debug_assert!(right_ys.len() <= u16::MAX as usize);
        if left_ys.is_empty() || right_ys.is_empty() {
            return;
        }

        for &r in &self.rmap_clean {
            self.rmap[r as usize] = RmapSlot::default();
        }
        self.rmap_clean.clear();

        for (j, &yr) in right_ys.iter().enumerate() {
            let r = (yr % K_BC) as usize;
            if self.rmap[r].count == 0 {
                // Equal residues within one bucket mean equal y, which the
                // sorted input keeps adjacent.
                self.rmap[r].start = j as u16;
                self.rmap_clean.push(r as u16);
            }
            self.rmap[r].count += 1;
        }

        let parity = (left_ys[0] / K_BC) % 2;
        for (i, &yl) in left_ys.iter().enumerate() {
            let ylb = yl % K_BC;
            let (bl, cl) = (ylb / K_C, ylb % K_C);
            for m in 0..K_EXTRA_BITS_POW as u64 {
                let tb = (bl + m) % K_B;
                let tc = (cl + (2 * m + parity) * (2 * m + parity)) % K_C;
                let slot = self.rmap[(tb * K_C + tc) as usize];
                for j in slot.start..slot.start + slot.count {
                    out.push((i as u16, j));
                }
            }
        }
    }
}

/// Computes f_{table_index} for a matched pair.
pub struct FxCalculator {
    k: u8,
    table_index: u8,
}

impl FxCalculator {
    /// `table_index` is the table being produced, in 2..=7.
    pub fn new(k: u8, table_index: u8) -> Self {
        debug_assert!((2..=7).contains(&table_index));
        Self { k, table_index }
    }

    /// Mixes `(y, left_meta, right_meta)` into the next table's y and
    /// metadata. The returned y is always k + K_EXTRA_BITS wide; table 7
    /// truncates it when storing f7.
    pub fn calculate(&self, y: u64, left_meta: &Meta, right_meta: &Meta) -> (u64, Meta) {
        let k = self.k as u32;
        let mut input = BitWriter::with_capacity(64);
        input.push(y as u128, k + K_EXTRA_BITS);
        left_meta.append_to(&mut input);
        right_meta.append_to(&mut input);
        let input_bits = input.bit_len() as u32;
        let bytes = input.into_padded();

        let digest = Blake2b512::digest(&bytes[..cdiv(input_bits, 8) as usize]);
        let mut dbuf = [0u8; 71];
        dbuf[..64].copy_from_slice(&digest);

        let new_y = slice_u64_full(&dbuf, 0, k + K_EXTRA_BITS);
        let out_len = if self.table_index == 7 {
            0
        } else {
            k * K_VECTOR_LENS[self.table_index as usize + 1]
        };
        let new_meta = match self.table_index {
            2 | 3 => Meta::concat(left_meta, right_meta),
            4..=6 => Meta::from_slice(&dbuf, k + K_EXTRA_BITS, out_len),
            _ => Meta::empty(),
        };
        (new_y, new_meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ID: [u8; K_ID_LEN] = [0xab; K_ID_LEN];

    #[test]
    fn test_f1_deterministic() {
        let f1 = F1Generator::new(20, &TEST_ID);
        let a = f1.generate(0, 100);
        let b = f1.generate(0, 100);
        assert_eq!(a, b);
    }

    #[test]
    fn test_f1_windows_agree() {
        // Generating in two halves must match one full run.
        let f1 = F1Generator::new(19, &TEST_ID);
        let full = f1.generate(0, 200);
        let mut halves = f1.generate(0, 77);
        halves.extend(f1.generate(77, 123));
        assert_eq!(full, halves);
    }

    #[test]
    fn test_f1_y_width_and_extra_bits() {
        let k = 18u32;
        let f1 = F1Generator::new(18, &TEST_ID);
        for (y, x) in f1.generate((1 << 18) - 500, 500) {
            assert!(y < 1u64 << (k + K_EXTRA_BITS));
            assert_eq!(y & ((1 << K_EXTRA_BITS) - 1), x >> (k - K_EXTRA_BITS));
        }
    }

    #[test]
    fn test_f1_different_ids_diverge() {
        let a = F1Generator::new(20, &TEST_ID).generate(0, 64);
        let b = F1Generator::new(20, &[0x11; K_ID_LEN]).generate(0, 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_matcher_against_naive_predicate() {
        // Two synthetic adjacent buckets with a spread of residues.
        let bucket = 7u64;
        let left: Vec<u64> = (0..300u64)
            .map(|i| bucket * K_BC + (i * 97 + 13) % K_BC)
            .collect();
        let mut right: Vec<u64> = (0..280u64)
            .map(|i| (bucket + 1) * K_BC + (i * 89 + 41) % K_BC)
            .collect();
        right.sort_unstable();

        let mut matcher = Matcher::new();
        let mut got = Vec::new();
        matcher.find_matches(&left, &right, &mut got);
        let got: std::collections::HashSet<(u16, u16)> = got.into_iter().collect();

        let parity = bucket % 2;
        let mut expected = std::collections::HashSet::new();
        for (i, &yl) in left.iter().enumerate() {
            let (bl, cl) = ((yl % K_BC) / K_C, (yl % K_BC) % K_C);
            for (j, &yr) in right.iter().enumerate() {
                let (br, cr) = ((yr % K_BC) / K_C, (yr % K_BC) % K_C);
                let hit = (0..K_EXTRA_BITS_POW as u64).any(|m| {
                    br == (bl + m) % K_B
                        && cr == (cl + (2 * m + parity) * (2 * m + parity)) % K_C
                });
                if hit {
                    expected.insert((i as u16, j as u16));
                }
            }
        }
        assert_eq!(got, expected);
        assert!(!got.is_empty(), "test data produced no matches at all");
    }

    #[test]
    fn test_matcher_duplicate_right_values() {
        let bucket = 2u64;
        let yl = bucket * K_BC; // b = 0, c = 0
        // Right value matching m = 0: b = 0, c = parity^2 = 0 (parity 0).
        let yr = (bucket + 1) * K_BC;
        let mut matcher = Matcher::new();
        let mut got = Vec::new();
        matcher.find_matches(&[yl], &[yr, yr], &mut got);
        assert_eq!(got, vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn test_fx_metadata_lengths() {
        let k = 18u8;
        let l = Meta::from_u64(123, k as u32);
        let r = Meta::from_u64(456, k as u32);

        let (y2, m2) = FxCalculator::new(k, 2).calculate(777, &l, &r);
        assert!(y2 < 1u64 << (k as u32 + K_EXTRA_BITS));
        assert_eq!(m2.bits(), 2 * k as u32);

        let (_, m3) = FxCalculator::new(k, 3).calculate(777, &m2, &m2);
        assert_eq!(m3.bits(), 4 * k as u32);

        let (_, m4) = FxCalculator::new(k, 4).calculate(777, &m3, &m3);
        assert_eq!(m4.bits(), 4 * k as u32);

        let (_, m7) = FxCalculator::new(k, 7).calculate(777, &Meta::empty(), &Meta::empty());
        assert_eq!(m7.bits(), 0);
    }

    #[test]
    fn test_fx_concat_matches_inputs() {
        let k = 18u32;
        let l = Meta::from_u64(0x2aaaa & ((1 << k) - 1), k);
        let r = Meta::from_u64(0x15555 & ((1 << k) - 1), k);
        let (_, m) = FxCalculator::new(18, 2).calculate(1, &l, &r);

        let mut w = BitWriter::new();
        m.append_to(&mut w);
        let bytes = w.into_padded();
        assert_eq!(slice_u64_full(&bytes, 0, k), 0x2aaaa & ((1 << k) - 1));
        assert_eq!(slice_u64_full(&bytes, k, k), 0x15555 & ((1 << k) - 1));
    }

    #[test]
    fn test_fx_deterministic_and_input_sensitive() {
        let k = 20u8;
        let l = Meta::from_u64(1, k as u32);
        let r = Meta::from_u64(2, k as u32);
        let fx = FxCalculator::new(k, 2);
        assert_eq!(fx.calculate(5, &l, &r).0, fx.calculate(5, &l, &r).0);
        assert_ne!(fx.calculate(5, &l, &r).0, fx.calculate(6, &l, &r).0);
        assert_ne!(fx.calculate(5, &l, &r).0, fx.calculate(5, &r, &l).0);
    }
}
