//! Line-point encoding and the ANS delta codec.
//!
//! A line point packs an unordered pair {x, y} into one integer through the
//! strictly monotone bijection `C(max, 2) + min`. Park and checkpoint
//! deltas are entropy-coded with a table-based ANS keyed by a rate
//! parameter R; when coding does not pay (or a delta falls outside the
//! alphabet) the raw bytes are stored behind the 0x8000 length flag.

use orchard_common::{PlotError, Result};

/// Packs an unordered pair into its line point.
pub fn square_to_line_point(x: u64, y: u64) -> u128 {
    let (hi, lo) = if x > y { (x, y) } else { (y, x) };
    (hi as u128) * (hi as u128 - 1) / 2 + lo as u128
}

/// Inverts [`square_to_line_point`]; returns `(hi, lo)`.
pub fn line_point_to_square(lp: u128) -> (u64, u64) {
    if lp == 0 {
        return (1, 0);
    }
    // hi is the largest h with C(h, 2) <= lp.
    let mut h = (1 + isqrt(1 + 8 * lp)) / 2;
    while h * (h - 1) / 2 > lp {
        h -= 1;
    }
    while (h + 1) * h / 2 <= lp {
        h += 1;
    }
    ((h as u64), (lp - h * (h - 1) / 2) as u64)
}

fn isqrt(n: u128) -> u128 {
    if n == 0 {
        return 0;
    }
    let mut x = (n as f64).sqrt() as u128;
    while x > 0 && x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x
}

/// ANS state-table size.
const TABLE_LOG: u32 = 12;
const TABLE_SIZE: u32 = 1 << TABLE_LOG;

/// A table-based ANS codec over small delta values.
///
/// The symbol distribution is geometric with mean R, quantized to
/// `TABLE_SIZE` slots; both directions are built from the same spread so
/// the pair round-trips by construction. One codec per (table, R) pairing
/// is built and reused across parks.
pub struct AnsCodec {
    counts: Vec<u32>,
    dec_sym: Vec<u8>,
    dec_nbits: Vec<u8>,
    dec_base: Vec<u32>,
    enc_start: Vec<u32>,
    enc_table: Vec<u16>,
}

impl AnsCodec {
    /// Builds the codec for rate parameter `r`.
    pub fn new(r: f64) -> Self {
        let counts = quantize_distribution(r);
        let nsyms = counts.len();

        // FSE-style symbol spread; step is odd, so it visits every slot.
        let step = ((TABLE_SIZE >> 1) + (TABLE_SIZE >> 3) + 3) as usize;
        let mask = (TABLE_SIZE - 1) as usize;
        let mut spread = vec![0u8; TABLE_SIZE as usize];
        let mut pos = 0usize;
        for (sym, &count) in counts.iter().enumerate() {
            for _ in 0..count {
                spread[pos] = sym as u8;
                pos = (pos + step) & mask;
            }
        }

        let mut enc_start = vec![0u32; nsyms];
        let mut acc = 0u32;
        for (sym, &count) in counts.iter().enumerate() {
            enc_start[sym] = acc;
            acc += count;
        }

        let mut dec_sym = vec![0u8; TABLE_SIZE as usize];
        let mut dec_nbits = vec![0u8; TABLE_SIZE as usize];
        let mut dec_base = vec![0u32; TABLE_SIZE as usize];
        let mut enc_table = vec![0u16; TABLE_SIZE as usize];
        let mut next = counts.clone();
        for t in 0..TABLE_SIZE as usize {
            let sym = spread[t] as usize;
            let x_next = next[sym];
            next[sym] += 1;
            let nbits = TABLE_LOG - (31 - x_next.leading_zeros());
            dec_sym[t] = sym as u8;
            dec_nbits[t] = nbits as u8;
            dec_base[t] = x_next << nbits;
            enc_table[(enc_start[sym] + (x_next - counts[sym])) as usize] =
                (TABLE_SIZE + t as u32) as u16;
        }

        Self {
            counts,
            dec_sym,
            dec_nbits,
            dec_base,
            enc_start,
            enc_table,
        }
    }

    /// Number of representable delta values.
    pub fn alphabet_size(&self) -> usize {
        self.counts.len()
    }

    /// Encodes `deltas`, or `None` when a delta falls outside the alphabet.
    pub fn encode(&self, deltas: &[u8]) -> Option<Vec<u8>> {
        if deltas.is_empty() {
            return Some(Vec::new());
        }
        if deltas.iter().any(|&d| d as usize >= self.counts.len()) {
            return None;
        }

        // Symbols are encoded in reverse so the decoder replays them
        // forward; each step's bits stack up and the whole stream flips.
        let mut state = TABLE_SIZE;
        let mut acc: Vec<bool> = Vec::with_capacity(deltas.len() * 4);
        for &d in deltas.iter().rev() {
            let sym = d as usize;
            let c = self.counts[sym];
            let ratio = state / c;
            let nbits = 31 - ratio.leading_zeros();
            for j in 0..nbits {
                acc.push((state >> j) & 1 == 1);
            }
            state = self.enc_table[(self.enc_start[sym] + (state >> nbits) - c) as usize] as u32;
        }
        acc.reverse();

        let mut out = Vec::with_capacity(2 + acc.len() / 8 + 1);
        out.extend_from_slice(&((state - TABLE_SIZE) as u16).to_le_bytes());
        let mut byte = 0u8;
        for (i, bit) in acc.iter().enumerate() {
            byte = (byte << 1) | *bit as u8;
            if i % 8 == 7 {
                out.push(byte);
                byte = 0;
            }
        }
        if acc.len() % 8 != 0 {
            out.push(byte << (8 - acc.len() % 8));
        }
        Some(out)
    }

    /// Decodes `count` deltas from `bytes`.
    pub fn decode(&self, bytes: &[u8], count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if bytes.len() < 2 {
            return Err(PlotError::Corruption(
                "ANS stream shorter than its state header".to_string(),
            ));
        }
        let mut state = TABLE_SIZE + u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
        if state >= 2 * TABLE_SIZE {
            return Err(PlotError::Corruption("ANS state out of range".to_string()));
        }
        let stream = &bytes[2..];
        let mut bit_pos = 0usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let t = (state - TABLE_SIZE) as usize;
            out.push(self.dec_sym[t]);
            let nbits = self.dec_nbits[t] as usize;
            let mut b = 0u32;
            for _ in 0..nbits {
                let byte = stream.get(bit_pos / 8).copied().ok_or_else(|| {
                    PlotError::Corruption("ANS stream ended mid-symbol".to_string())
                })?;
                b = (b << 1) | ((byte >> (7 - bit_pos % 8)) & 1) as u32;
                bit_pos += 1;
            }
            state = self.dec_base[t] + b;
        }
        Ok(out)
    }
}

/// Quantizes the geometric distribution with mean `r` to TABLE_SIZE slots.
///
/// Every byte value stays representable: symbols whose probability rounds
/// away keep one slot each, so rare large deltas (the tail of the f7 gap
/// distribution) still encode rather than forcing oversized raw blocks.
fn quantize_distribution(r: f64) -> Vec<u32> {
    let q = r / (r + 1.0);
    let mut counts: Vec<u32> = Vec::new();
    let mut p = 1.0 - q;
    while counts.len() < 256 {
        let c = (p * TABLE_SIZE as f64).round() as u32;
        counts.push(c.max(1));
        p *= q;
    }
    // Settle rounding drift on the most probable symbol; the drift is
    // bounded by half a slot per symbol, far below counts[0].
    let sum: u32 = counts.iter().sum();
    if sum > TABLE_SIZE {
        debug_assert!(counts[0] > sum - TABLE_SIZE);
        counts[0] -= sum - TABLE_SIZE;
    } else {
        counts[0] += TABLE_SIZE - sum;
    }
    debug_assert_eq!(counts.iter().sum::<u32>(), TABLE_SIZE);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchard_common::constants::{K_C3_R, K_MAX_AVERAGE_DELTA, K_MAX_AVERAGE_DELTA_TABLE1};
    use rand::Rng;

    #[test]
    fn test_line_point_known_values() {
        assert_eq!(square_to_line_point(0, 1), 0);
        assert_eq!(square_to_line_point(1, 0), 0);
        assert_eq!(square_to_line_point(0, 2), 1);
        assert_eq!(square_to_line_point(1, 2), 2);
        assert_eq!(square_to_line_point(0, 3), 3);
    }

    #[test]
    fn test_line_point_monotone_in_pairs() {
        let mut last = None;
        for y in 1..50u64 {
            for x in 0..y {
                let lp = square_to_line_point(x, y);
                if let Some(prev) = last {
                    assert!(lp > prev);
                }
                last = Some(lp);
            }
        }
    }

    #[test]
    fn test_line_point_roundtrip_random() {
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let k = rng.gen_range(18..=50u32);
            let y = rng.gen_range(1..(1u64 << k));
            let x = rng.gen_range(0..y);
            let lp = square_to_line_point(x, y);
            assert!(lp < 1u128 << (2 * k - 1));
            assert_eq!(line_point_to_square(lp), (y, x));
        }
    }

    #[test]
    fn test_line_point_roundtrip_extremes() {
        for &(x, y) in &[(0u64, 1u64), (0, u32::MAX as u64), ((1 << 50) - 2, (1 << 50) - 1)] {
            let lp = square_to_line_point(x, y);
            assert_eq!(line_point_to_square(lp), (y.max(x), y.min(x)));
        }
    }

    #[test]
    fn test_ans_roundtrip_realistic_deltas() {
        let mut rng = rand::thread_rng();
        for &r in &[K_MAX_AVERAGE_DELTA_TABLE1, K_MAX_AVERAGE_DELTA, K_C3_R, 2.0] {
            let codec = AnsCodec::new(r);
            for _ in 0..50 {
                let n = rng.gen_range(1..2048usize);
                let deltas: Vec<u8> = (0..n)
                    .map(|_| {
                        // Geometric-ish small values like real park deltas.
                        let mut d = 0u8;
                        while rng.gen_bool(r / (r + 1.0)) && (d as usize) < 8 {
                            d += 1;
                        }
                        d
                    })
                    .collect();
                let encoded = codec.encode(&deltas).expect("in-alphabet deltas");
                assert_eq!(codec.decode(&encoded, n).unwrap(), deltas);
            }
        }
    }

    #[test]
    fn test_ans_compresses_typical_streams() {
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        let mut rng = rand::thread_rng();
        let deltas: Vec<u8> = (0..2047).map(|_| rng.gen_range(0..4)).collect();
        let encoded = codec.encode(&deltas).unwrap();
        assert!(
            encoded.len() < deltas.len(),
            "coded {} bytes from {}",
            encoded.len(),
            deltas.len()
        );
    }

    #[test]
    fn test_ans_all_zero_deltas() {
        let codec = AnsCodec::new(K_C3_R);
        let deltas = vec![0u8; 1000];
        let encoded = codec.encode(&deltas).unwrap();
        // Roughly one bit per zero under the R = 1 model.
        assert!(encoded.len() < 300);
        assert_eq!(codec.decode(&encoded, 1000).unwrap(), deltas);
    }

    #[test]
    fn test_ans_empty() {
        let codec = AnsCodec::new(K_C3_R);
        let encoded = codec.encode(&[]).unwrap();
        assert!(encoded.is_empty());
        assert_eq!(codec.decode(&encoded, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_ans_covers_all_byte_deltas() {
        let codec = AnsCodec::new(K_C3_R);
        assert_eq!(codec.alphabet_size(), 256);
        // Rare large deltas (sparse f7 gaps) still round-trip.
        let deltas = vec![0u8, 1, 0, 254, 2, 0, 0, 113, 1, 1];
        let encoded = codec.encode(&deltas).unwrap();
        assert_eq!(codec.decode(&encoded, deltas.len()).unwrap(), deltas);
    }

    #[test]
    fn test_ans_truncated_stream_is_corruption() {
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        let deltas: Vec<u8> = (0..500).map(|i| (i % 5) as u8).collect();
        let encoded = codec.encode(&deltas).unwrap();
        let result = codec.decode(&encoded[..encoded.len() / 2], 500);
        assert!(result.is_err());
    }

    #[test]
    fn test_ans_single_delta() {
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        for d in 0..=255u8 {
            let encoded = codec.encode(&[d]).unwrap();
            assert_eq!(codec.decode(&encoded, 1).unwrap(), vec![d]);
        }
    }
}
