use super::types::WordOrder;
use std::fmt;

/// Growable set of bit indexes, used for coil/discrete data and register flag views.
#[derive(Clone, Default)]
pub struct BitSet {
    blocks: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set whose storage can hold `bits` without reallocating.
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(bits.div_ceil(64)),
        }
    }

    /// Build a set from a 64-bit integer, bit 0 being the least significant bit.
    pub fn from_u64(value: u64) -> Self {
        let mut set = Self::new();
        if value != 0 {
            set.blocks.push(value);
        }
        set
    }

    /// Build a set from booleans, index 0 first.
    pub fn from_bools(bits: &[bool]) -> Self {
        let mut set = Self::with_capacity(bits.len());
        for (i, b) in bits.iter().enumerate() {
            if *b {
                set.set(i, true);
            }
        }
        set
    }

    /// Interpret register words as one integer (per `word_order`) and expose its bits.
    ///
    /// Bit 0 is the least significant bit of the least significant word.
    pub fn from_words(words: &[u16], word_order: WordOrder) -> Self {
        let count = words.len();
        let mut set = Self::with_capacity(count * 16);
        for (pos, w) in words.iter().enumerate() {
            let base = match word_order {
                WordOrder::LeastToMostSignificant => pos * 16,
                WordOrder::MostToLeastSignificant => (count - pos - 1) * 16,
            };
            for i in 0..16 {
                if (w >> i) & 1 == 1 {
                    set.set(base + i, true);
                }
            }
        }
        set
    }

    /// Pack bits `0..count * 16` into `count` words, the inverse of [`BitSet::from_words`].
    pub fn to_words(&self, count: usize, word_order: WordOrder) -> Vec<u16> {
        let mut out = vec![0u16; count];
        for i in self.iter_ones() {
            let word = i / 16;
            if word >= count {
                break;
            }
            let pos = match word_order {
                WordOrder::LeastToMostSignificant => word,
                WordOrder::MostToLeastSignificant => count - word - 1,
            };
            out[pos] |= 1 << (i % 16);
        }
        out
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.blocks
            .get(index / 64)
            .map(|b| (b >> (index % 64)) & 1 == 1)
            .unwrap_or(false)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        let block = index / 64;
        if block >= self.blocks.len() {
            if !value {
                return;
            }
            self.blocks.resize(block + 1, 0);
        }
        let mask = 1u64 << (index % 64);
        if value {
            self.blocks[block] |= mask;
        } else {
            self.blocks[block] &= !mask;
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// One past the highest set bit, or 0 when empty.
    pub fn len(&self) -> usize {
        for (i, b) in self.blocks.iter().enumerate().rev() {
            if *b != 0 {
                return i * 64 + (64 - b.leading_zeros() as usize);
            }
        }
        0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| *b == 0)
    }

    pub fn count_ones(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indexes of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks.iter().enumerate().flat_map(|(i, block)| {
            let mut b = *block;
            std::iter::from_fn(move || {
                if b == 0 {
                    return None;
                }
                let tz = b.trailing_zeros() as usize;
                b &= b - 1;
                Some(i * 64 + tz)
            })
        })
    }

    /// Copy of bits `from..from + count`, reindexed so `from` becomes 0.
    pub fn slice(&self, from: usize, count: usize) -> BitSet {
        let mut out = BitSet::with_capacity(count);
        for i in self.iter_ones() {
            if i < from {
                continue;
            }
            if i >= from + count {
                break;
            }
            out.set(i - from, true);
        }
        out
    }

    /// Bits `0..count` as booleans.
    pub fn to_bools(&self, count: usize) -> Vec<bool> {
        (0..count).map(|i| self.get(i)).collect()
    }
}

impl PartialEq for BitSet {
    fn eq(&self, other: &Self) -> bool {
        let n = self.blocks.len().max(other.blocks.len());
        (0..n).all(|i| {
            self.blocks.get(i).copied().unwrap_or(0) == other.blocks.get(i).copied().unwrap_or(0)
        })
    }
}

impl Eq for BitSet {}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter_ones()).finish()
    }
}
