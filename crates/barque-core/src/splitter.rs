//! Streaming content-defined chunk boundary detection.
//!
//! A 48-byte window slides over the input; a cyclic-polynomial (buzhash)
//! fingerprint is updated in O(1) per byte, and a boundary is declared when
//! the low `split_bits` bits of the fingerprint match a fixed pattern.
//! Boundary positions depend only on the local window, so an edit shifts at
//! most the chunks overlapping it, which is the property deduplication
//! across edits relies on.

use crate::error::{BkError, Result};

/// Sliding window width in bytes.
pub const WINDOW_SIZE: usize = 48;

/// No boundary is declared before this many bytes have accumulated.
pub const MIN_CHUNK: usize = 512;

/// Hard upper bound on any chunk, regardless of `split_bits`.
pub const MAX_CHUNK: usize = 16 * 1024 * 1024;

pub const MIN_SPLIT_BITS: u32 = 8;
pub const MAX_SPLIT_BITS: u32 = 22;
pub const DEFAULT_SPLIT_BITS: u32 = 14;

/// splitmix64, used to derive the byte-substitution table deterministically.
const fn splitmix64(state: u64) -> (u64, u64) {
    let state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (state, z ^ (z >> 31))
}

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = 0x7061_636b_5f62_6172u64;
    let mut i = 0;
    while i < 256 {
        let (next, value) = splitmix64(state);
        state = next;
        table[i] = value;
        i += 1;
    }
    table
}

/// Byte-substitution table for the cyclic-polynomial fingerprint.
static BUZ_TABLE: [u64; 256] = build_table();

const fn initial_fingerprint() -> u64 {
    let table = build_table();
    let mut f = 0u64;
    let mut i = 0;
    while i < WINDOW_SIZE {
        f = f.rotate_left(1) ^ table[0];
        i += 1;
    }
    f
}

/// Fingerprint of the all-zero window a fresh splitter starts from. Seeding
/// with this keeps the fingerprint equal to the hash of the current window
/// at every position, so boundary decisions are a pure function of the last
/// 48 bytes and never of the byte offset.
static INITIAL_FINGERPRINT: u64 = initial_fingerprint();

/// Streaming boundary detector. Feed bytes with [`Splitter::roll`]; a `true`
/// return means a chunk ends after the byte just consumed.
#[derive(Clone)]
pub struct Splitter {
    mask: u64,
    max_chunk: usize,
    window: [u8; WINDOW_SIZE],
    pos: usize,
    fingerprint: u64,
    chunk_len: usize,
}

impl Splitter {
    /// Create a splitter. `split_bits` controls the expected chunk size
    /// (~2^split_bits bytes) and must lie in `[8, 22]`.
    pub fn new(split_bits: u32) -> Result<Self> {
        if !(MIN_SPLIT_BITS..=MAX_SPLIT_BITS).contains(&split_bits) {
            return Err(BkError::Config(format!(
                "split-bits must be between {MIN_SPLIT_BITS} and {MAX_SPLIT_BITS}, got {split_bits}"
            )));
        }
        let max_chunk = std::cmp::min(16usize << split_bits, MAX_CHUNK);
        Ok(Splitter {
            mask: (1u64 << split_bits) - 1,
            max_chunk,
            window: [0u8; WINDOW_SIZE],
            pos: 0,
            fingerprint: INITIAL_FINGERPRINT,
            chunk_len: 0,
        })
    }

    /// Largest chunk this splitter will emit before forcing a boundary.
    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Consume one byte. Returns `true` when a boundary falls immediately
    /// after it: either the fingerprint matched past the minimum chunk size,
    /// or the maximum chunk size forced a cut.
    pub fn roll(&mut self, byte: u8) -> bool {
        let outgoing = self.window[self.pos];
        self.window[self.pos] = byte;
        self.pos = (self.pos + 1) % WINDOW_SIZE;

        self.fingerprint = self.fingerprint.rotate_left(1)
            ^ BUZ_TABLE[outgoing as usize].rotate_left(WINDOW_SIZE as u32)
            ^ BUZ_TABLE[byte as usize];

        self.chunk_len += 1;
        if self.chunk_len >= self.max_chunk {
            self.chunk_len = 0;
            return true;
        }
        if self.chunk_len >= MIN_CHUNK && (self.fingerprint & self.mask) == self.mask {
            self.chunk_len = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random bytes for boundary tests.
    fn prng_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let (next, value) = splitmix64(state);
            state = next;
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    /// Offsets (one past the last byte of each chunk) over a whole buffer.
    fn boundaries(data: &[u8], split_bits: u32) -> Vec<usize> {
        let mut splitter = Splitter::new(split_bits).unwrap();
        let mut cuts = Vec::new();
        for (i, &b) in data.iter().enumerate() {
            if splitter.roll(b) {
                cuts.push(i + 1);
            }
        }
        cuts
    }

    #[test]
    fn rejects_out_of_range_split_bits() {
        assert!(Splitter::new(7).is_err());
        assert!(Splitter::new(23).is_err());
        assert!(Splitter::new(8).is_ok());
        assert!(Splitter::new(22).is_ok());
    }

    #[test]
    fn deterministic_across_feed_sizes() {
        let data = prng_bytes(256 * 1024, 1);
        let whole = boundaries(&data, 12);

        // Same input fed a byte at a time through a fresh splitter must
        // produce the same cuts (roll() already is byte-at-a-time; re-run to
        // check statelessness across constructions).
        let again = boundaries(&data, 12);
        assert_eq!(whole, again);
        assert!(!whole.is_empty());
    }

    #[test]
    fn respects_min_and_max_chunk() {
        let data = prng_bytes(1024 * 1024, 2);
        let cuts = boundaries(&data, 10);
        let max = Splitter::new(10).unwrap().max_chunk();
        let mut prev = 0;
        for &cut in &cuts {
            let len = cut - prev;
            assert!(len >= MIN_CHUNK, "chunk of {len} bytes below minimum");
            assert!(len <= max, "chunk of {len} bytes above maximum");
            prev = cut;
        }
    }

    #[test]
    fn constant_input_hits_forced_boundary() {
        // All-zero input never matches the fingerprint pattern by luck alone;
        // every chunk must be exactly max_chunk.
        let splitter = Splitter::new(8).unwrap();
        let max = splitter.max_chunk();
        let data = vec![0u8; max * 3];
        let cuts = boundaries(&data, 8);
        assert_eq!(cuts, vec![max, 2 * max, 3 * max]);
    }

    #[test]
    fn insertion_shifts_only_local_boundaries() {
        let data = prng_bytes(512 * 1024, 3);
        let edit_at = 200 * 1024;
        let mut edited = data.clone();
        edited.insert(edit_at, 0xA5);

        let cuts_a = boundaries(&data, 12);
        let cuts_b = boundaries(&edited, 12);

        // Every boundary well before the edit is unchanged; every boundary
        // well after it appears shifted by exactly one byte.
        let before_a: Vec<_> = cuts_a.iter().filter(|&&c| c < edit_at).collect();
        let before_b: Vec<_> = cuts_b.iter().filter(|&&c| c < edit_at).collect();
        assert_eq!(before_a, before_b);

        let resync = edit_at + 64 * 1024;
        let after_a: Vec<_> = cuts_a.iter().filter(|&&c| c > resync).collect();
        let after_b: Vec<_> = cuts_b
            .iter()
            .filter(|&&c| c > resync)
            .map(|&c| c - 1)
            .collect();
        let shared = after_a
            .iter()
            .filter(|&&&c| after_b.contains(&c))
            .count();
        assert!(
            shared * 10 >= after_a.len() * 9,
            "downstream boundaries did not resynchronize: {shared}/{}",
            after_a.len()
        );
    }

    #[test]
    fn expected_chunk_size_tracks_split_bits() {
        let data = prng_bytes(2 * 1024 * 1024, 4);
        let cuts = boundaries(&data, 12);
        // ~2^12 byte chunks over 2 MiB: expect on the order of 512 cuts.
        // Allow a generous band; the point is the parameter has effect.
        assert!(cuts.len() > 128, "too few chunks: {}", cuts.len());
        assert!(cuts.len() < 4096, "too many chunks: {}", cuts.len());
    }
}
