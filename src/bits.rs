//! Packed Bit Storage
//!
//! Sign bits are packed 64 per `u64` word so that the similarity kernels can
//! count agreements with `count_ones` instead of walking individual bools.
//!
//! Invariant shared by every type here: padding bits past the logical length
//! of a word run are always zero. Kernels rely on it (two zero padding bits
//! never count as a mismatch).

/// Bits per storage word
pub const WORD_BITS: usize = 64;

/// Number of words needed for `len` bits
#[inline(always)]
pub const fn words_for(len: usize) -> usize {
    (len + WORD_BITS - 1) / WORD_BITS
}

#[inline(always)]
const fn tail_mask(len: usize) -> u64 {
    match len % WORD_BITS {
        0 => u64::MAX,
        r => (1u64 << r) - 1,
    }
}

// ============================================================================
// BitVector
// ============================================================================

/// Fixed-length packed bit vector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
    len: usize,
}

impl BitVector {
    /// All-`false` vector of `len` bits
    pub fn new(len: usize) -> Self {
        Self { words: vec![0u64; words_for(len)], len }
    }

    /// Pack a slice of bools
    pub fn from_bools(bits: &[bool]) -> Self {
        let mut v = Self::new(bits.len());
        for (i, &b) in bits.iter().enumerate() {
            if b {
                v.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
            }
        }
        v
    }

    /// Resize to `len` bits and clear every bit, reusing the allocation
    pub fn reset(&mut self, len: usize) {
        self.words.clear();
        self.words.resize(words_for(len), 0);
        self.len = len;
    }

    /// Number of bits
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the vector holds no bits
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `i`
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len, "bit {} out of range {}", i, self.len);
        (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 != 0
    }

    /// Write bit `i`
    #[inline]
    pub fn set(&mut self, i: usize, value: bool) {
        debug_assert!(i < self.len, "bit {} out of range {}", i, self.len);
        let mask = 1u64 << (i % WORD_BITS);
        let word = &mut self.words[i / WORD_BITS];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Raw storage words (padding bits are zero)
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Words reserved by the backing allocation
    #[inline]
    pub fn word_capacity(&self) -> usize {
        self.words.capacity()
    }

    /// Number of `true` bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate bits in order
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// Unpack into a `Vec<bool>`
    pub fn to_bools(&self) -> Vec<bool> {
        self.iter().collect()
    }

    /// Number of positions where `self` and `other` agree
    ///
    /// This is the XNOR-popcount of the two vectors.
    #[inline]
    pub fn matches(&self, other: &BitVector) -> usize {
        debug_assert_eq!(self.len, other.len);
        xnor_popcount(&self.words, &other.words, self.len)
    }
}

/// Count agreeing bits between two word runs holding `len` logical bits
///
/// Padding bits are zero on both sides, so counting mismatches with XOR and
/// subtracting from `len` never miscounts the tail.
#[inline]
pub fn xnor_popcount(a: &[u64], b: &[u64], len: usize) -> usize {
    debug_assert_eq!(a.len(), b.len());
    let mismatches: usize = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones() as usize)
        .sum();
    len - mismatches
}

// ============================================================================
// BitMatrix: one packed row per output unit
// ============================================================================

/// Binarized weight matrix for a fully-connected layer
///
/// The logical (persisted) order is connection-major: linear index
/// `c * units + i` addresses connection `c` of output unit `i`. Storage is
/// transposed into one packed row per output unit so that a whole fan-in can
/// be compared against the input with word-wide XNOR-popcount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitMatrix {
    rows: Vec<u64>,
    fan_in: usize,
    units: usize,
    /// Number of u64 words per unit row: `(fan_in + 63) / 64`
    words_per_row: usize,
}

impl BitMatrix {
    /// All-`false` matrix
    pub fn new(fan_in: usize, units: usize) -> Self {
        let words_per_row = words_for(fan_in);
        Self {
            rows: vec![0u64; words_per_row * units],
            fan_in,
            units,
            words_per_row,
        }
    }

    /// Build from bools in linear `c * units + i` order
    pub fn from_linear_bools(bits: &[bool], fan_in: usize, units: usize) -> Self {
        debug_assert_eq!(bits.len(), fan_in * units);
        let mut m = Self::new(fan_in, units);
        for (idx, &b) in bits.iter().enumerate() {
            if b {
                m.set_linear(idx, true);
            }
        }
        m
    }

    /// Connections per output unit
    #[inline]
    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    /// Number of output units
    #[inline]
    pub fn units(&self) -> usize {
        self.units
    }

    /// Total number of weight bits
    #[inline]
    pub fn len(&self) -> usize {
        self.fan_in * self.units
    }

    /// True when the matrix holds no bits
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of u64 words per unit row
    #[inline]
    pub fn words_per_row(&self) -> usize {
        self.words_per_row
    }

    /// Packed fan-in bits of output unit `unit`
    #[inline]
    pub fn row(&self, unit: usize) -> &[u64] {
        let start = unit * self.words_per_row;
        &self.rows[start..start + self.words_per_row]
    }

    /// Weight bit of connection `c` into unit `i`
    #[inline]
    pub fn get(&self, c: usize, i: usize) -> bool {
        debug_assert!(c < self.fan_in && i < self.units);
        let word = self.rows[i * self.words_per_row + c / WORD_BITS];
        (word >> (c % WORD_BITS)) & 1 != 0
    }

    /// Set the weight bit of connection `c` into unit `i`
    #[inline]
    pub fn set(&mut self, c: usize, i: usize, value: bool) {
        debug_assert!(c < self.fan_in && i < self.units);
        let mask = 1u64 << (c % WORD_BITS);
        let word = &mut self.rows[i * self.words_per_row + c / WORD_BITS];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Weight bit at linear index `c * units + i`
    #[inline]
    pub fn get_linear(&self, idx: usize) -> bool {
        self.get(idx / self.units, idx % self.units)
    }

    /// Set the weight bit at linear index `c * units + i`
    #[inline]
    pub fn set_linear(&mut self, idx: usize, value: bool) {
        self.set(idx / self.units, idx % self.units, value)
    }

    /// Negate every fan-in bit of output unit `unit`
    pub fn flip_unit(&mut self, unit: usize) {
        let start = unit * self.words_per_row;
        let row = &mut self.rows[start..start + self.words_per_row];
        for word in row.iter_mut() {
            *word = !*word;
        }
        if let Some(last) = row.last_mut() {
            *last &= tail_mask(self.fan_in);
        }
    }

    /// Iterate bits in linear `c * units + i` order
    pub fn iter_linear(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.fan_in).flat_map(move |c| (0..self.units).map(move |i| self.get(c, i)))
    }

    /// Unpack into bools in linear order
    pub fn to_linear_bools(&self) -> Vec<bool> {
        self.iter_linear().collect()
    }

    /// Number of `true` bits
    pub fn count_ones(&self) -> usize {
        self.rows.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Memory footprint of the packed rows in bytes
    #[inline]
    pub fn memory_bytes(&self) -> usize {
        self.rows.len() * core::mem::size_of::<u64>()
    }

    /// Compression ratio vs FP32 (32x when fan-in is a multiple of 64)
    #[inline]
    pub fn compression_ratio(&self) -> f32 {
        let mem = self.memory_bytes();
        if mem == 0 {
            return 0.0;
        }
        (self.len() * 4) as f32 / mem as f32
    }
}

// ============================================================================
// Tests
// ============================================================================
