//! Fixed-size park serialization.
//!
//! A park stores K_ENTRIES_PER_PARK consecutive line points as one 2k-bit
//! anchor plus stub/delta pairs for the successive differences: the stub is
//! the low k - K_STUB_MINUS_BITS bits of a difference, the delta its high
//! bits, entropy-coded. Every park of a table occupies exactly
//! `park_size(k, table)` bytes so parks are addressable by index.

use crate::encoding::AnsCodec;
use orchard_common::bits::{BitReader, BitWriter};
use orchard_common::constants::{K_ENTRIES_PER_PARK, K_STUB_MINUS_BITS};
use orchard_common::entry_sizes::{line_point_size, max_deltas_size, park_size, stubs_size};
use orchard_common::{PlotError, Result};

/// Raw (uncoded) delta blocks flag this bit in the length prefix.
pub const PARK_RAW_DELTAS_FLAG: u16 = 0x8000;

/// Serializes one park into `out` (cleared first), padded to
/// `park_size(k, table_index)` bytes.
///
/// `stubs` and `deltas` hold the `n - 1` successive differences of an
/// n-entry park, n at most K_ENTRIES_PER_PARK.
pub fn write_park(
    k: u8,
    table_index: u8,
    codec: &AnsCodec,
    first_line_point: u128,
    stubs: &[u64],
    deltas: &[u8],
    out: &mut Vec<u8>,
) -> Result<()> {
    debug_assert_eq!(stubs.len(), deltas.len());
    debug_assert!(stubs.len() < K_ENTRIES_PER_PARK as usize);
    let stub_bits = k as u32 - K_STUB_MINUS_BITS;

    out.clear();

    let mut w = BitWriter::with_capacity(line_point_size(k) as usize);
    w.push(first_line_point, 2 * k as u32);
    w.pad_to_byte();
    out.extend_from_slice(w.as_slice());
    out.resize(line_point_size(k) as usize, 0);

    w.clear();
    for &stub in stubs {
        w.push(stub as u128, stub_bits);
    }
    w.pad_to_byte();
    out.extend_from_slice(w.as_slice());
    out.resize((line_point_size(k) + stubs_size(k)) as usize, 0);

    let (encoded, raw): (Vec<u8>, bool) = match codec.encode(deltas) {
        Some(coded) if coded.len() < deltas.len() => (coded, false),
        _ => (deltas.to_vec(), true),
    };
    if encoded.len() + 2 > max_deltas_size(k, table_index) as usize {
        return Err(PlotError::Corruption(format!(
            "park deltas need {} bytes, table {} allows {}",
            encoded.len() + 2,
            table_index,
            max_deltas_size(k, table_index)
        )));
    }
    let len_field = encoded.len() as u16 | if raw { PARK_RAW_DELTAS_FLAG } else { 0 };
    out.extend_from_slice(&len_field.to_le_bytes());
    out.extend_from_slice(&encoded);

    out.resize(park_size(k, table_index) as usize, 0);
    Ok(())
}

/// Decodes the `num_entries` line points of one park.
pub fn decode_park(
    k: u8,
    table_index: u8,
    codec: &AnsCodec,
    bytes: &[u8],
    num_entries: usize,
) -> Result<Vec<u128>> {
    if bytes.len() < park_size(k, table_index) as usize {
        return Err(PlotError::Corruption(format!(
            "park buffer of {} bytes is smaller than the {} the format requires",
            bytes.len(),
            park_size(k, table_index)
        )));
    }
    if num_entries == 0 {
        return Ok(Vec::new());
    }
    let stub_bits = k as u32 - K_STUB_MINUS_BITS;

    let mut r = BitReader::new(bytes);
    let first_line_point = r.read_u128(2 * k as u32);

    r.skip(line_point_size(k) * 8 - 2 * k as u32);
    let mut stubs = Vec::with_capacity(num_entries - 1);
    for _ in 0..num_entries - 1 {
        stubs.push(r.read_u64(stub_bits));
    }

    let deltas_off = (line_point_size(k) + stubs_size(k)) as usize;
    let len_field = u16::from_le_bytes([bytes[deltas_off], bytes[deltas_off + 1]]);
    let raw = len_field & PARK_RAW_DELTAS_FLAG != 0;
    let len = (len_field & !PARK_RAW_DELTAS_FLAG) as usize;
    if deltas_off + 2 + len > bytes.len() {
        return Err(PlotError::Corruption(
            "park delta block runs past the park".to_string(),
        ));
    }
    let block = &bytes[deltas_off + 2..deltas_off + 2 + len];
    let deltas = if raw {
        if len != num_entries - 1 {
            return Err(PlotError::Corruption(format!(
                "raw park deltas hold {} entries, expected {}",
                len,
                num_entries - 1
            )));
        }
        block.to_vec()
    } else {
        codec.decode(block, num_entries - 1)?
    };

    let mut line_points = Vec::with_capacity(num_entries);
    let mut lp = first_line_point;
    line_points.push(lp);
    for (stub, delta) in stubs.iter().zip(&deltas) {
        lp += ((*delta as u128) << stub_bits) | *stub as u128;
        line_points.push(lp);
    }
    Ok(line_points)
}

/// Accumulates line points and flushes full parks through `write_park`.
pub struct ParkBuilder {
    k: u8,
    table_index: u8,
    first: u128,
    prev: u128,
    stubs: Vec<u64>,
    deltas: Vec<u8>,
    count: u32,
}

impl ParkBuilder {
    pub fn new(k: u8, table_index: u8) -> Self {
        Self {
            k,
            table_index,
            first: 0,
            prev: 0,
            stubs: Vec::with_capacity(K_ENTRIES_PER_PARK as usize),
            deltas: Vec::with_capacity(K_ENTRIES_PER_PARK as usize),
            count: 0,
        }
    }

    /// Entries currently buffered (0 to K_ENTRIES_PER_PARK - 1 after any
    /// `push` that returned a full park).
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds the next line point in sorted order. Returns true once the
    /// builder holds a full park, which the caller then flushes.
    pub fn push(&mut self, line_point: u128) -> Result<bool> {
        if self.count == 0 {
            self.first = line_point;
        } else {
            let diff = line_point - self.prev;
            let stub_bits = self.k as u32 - K_STUB_MINUS_BITS;
            let delta = diff >> stub_bits;
            if delta > u8::MAX as u128 {
                return Err(PlotError::Corruption(format!(
                    "line point difference {} exceeds the 8-bit park delta",
                    diff
                )));
            }
            self.deltas.push(delta as u8);
            self.stubs.push((diff & ((1u128 << stub_bits) - 1)) as u64);
        }
        self.prev = line_point;
        self.count += 1;
        Ok(self.count == K_ENTRIES_PER_PARK)
    }

    /// Serializes the buffered park into `out` and resets the builder.
    pub fn flush(&mut self, codec: &AnsCodec, out: &mut Vec<u8>) -> Result<()> {
        write_park(
            self.k,
            self.table_index,
            codec,
            self.first,
            &self.stubs,
            &self.deltas,
            out,
        )?;
        self.stubs.clear();
        self.deltas.clear();
        self.count = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchard_common::constants::K_MAX_AVERAGE_DELTA;
    use rand::Rng;

    fn random_line_points(k: u8, n: usize) -> Vec<u128> {
        let mut rng = rand::thread_rng();
        let stub_bits = k as u32 - K_STUB_MINUS_BITS;
        let mut lp: u128 = rng.gen_range(0..1u128 << k);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(lp);
            // Realistic spacing: a couple of delta bits, random stub.
            let delta = rng.gen_range(0..6u128);
            let stub = rng.gen_range(0..1u128 << stub_bits);
            lp += (delta << stub_bits) | stub;
        }
        out
    }

    fn park_from(k: u8, t: u8, codec: &AnsCodec, lps: &[u128]) -> Vec<u8> {
        let mut builder = ParkBuilder::new(k, t);
        let mut out = Vec::new();
        for &lp in lps {
            builder.push(lp).unwrap();
        }
        builder.flush(codec, &mut out).unwrap();
        out
    }

    #[test]
    fn test_full_park_roundtrip() {
        let (k, t) = (18u8, 2u8);
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        let lps = random_line_points(k, K_ENTRIES_PER_PARK as usize);
        let bytes = park_from(k, t, &codec, &lps);
        assert_eq!(bytes.len(), park_size(k, t) as usize);

        let decoded = decode_park(k, t, &codec, &bytes, lps.len()).unwrap();
        assert_eq!(decoded, lps);
    }

    #[test]
    fn test_partial_last_park_roundtrip() {
        let (k, t) = (20u8, 5u8);
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        for n in [1usize, 2, 37, 1000] {
            let lps = random_line_points(k, n);
            let bytes = park_from(k, t, &codec, &lps);
            assert_eq!(bytes.len(), park_size(k, t) as usize);
            assert_eq!(decode_park(k, t, &codec, &bytes, n).unwrap(), lps);
        }
    }

    #[test]
    fn test_raw_fallback_roundtrip() {
        let (k, t) = (18u8, 3u8);
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        let stub_bits = k as u32 - K_STUB_MINUS_BITS;
        // Deltas far outside the alphabet force the raw path.
        let mut lps = vec![1000u128];
        for i in 0..100 {
            lps.push(lps[i] + (200u128 << stub_bits));
        }
        let bytes = park_from(k, t, &codec, &lps);
        let deltas_off = (line_point_size(k) + stubs_size(k)) as usize;
        let len_field = u16::from_le_bytes([bytes[deltas_off], bytes[deltas_off + 1]]);
        assert!(len_field & PARK_RAW_DELTAS_FLAG != 0);

        assert_eq!(decode_park(k, t, &codec, &bytes, lps.len()).unwrap(), lps);
    }

    #[test]
    fn test_oversized_delta_is_corruption() {
        let k = 18u8;
        let mut builder = ParkBuilder::new(k, 1);
        builder.push(0).unwrap();
        let too_far = 256u128 << (k as u32 - K_STUB_MINUS_BITS);
        assert!(builder.push(too_far).is_err());
    }

    #[test]
    fn test_legacy_short_park_rejected() {
        let (k, t) = (18u8, 2u8);
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        let lps = random_line_points(k, 10);
        let bytes = park_from(k, t, &codec, &lps);
        let short = &bytes[..bytes.len() - 1];
        assert!(decode_park(k, t, &codec, short, 10).is_err());
    }

    #[test]
    fn test_builder_reports_full() {
        let codec = AnsCodec::new(K_MAX_AVERAGE_DELTA);
        let mut builder = ParkBuilder::new(18, 2);
        let lps = random_line_points(18, K_ENTRIES_PER_PARK as usize + 1);
        for (i, &lp) in lps.iter().enumerate().take(K_ENTRIES_PER_PARK as usize) {
            let full = builder.push(lp).unwrap();
            assert_eq!(full, i + 1 == K_ENTRIES_PER_PARK as usize);
        }
        let mut out = Vec::new();
        builder.flush(&codec, &mut out).unwrap();
        assert!(builder.is_empty());
        // The builder is reusable for the next park.
        builder.push(lps[K_ENTRIES_PER_PARK as usize]).unwrap();
        assert_eq!(builder.len(), 1);
    }
}
