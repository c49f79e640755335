//! Flat bit-array bitmap backend
//!
//! One bit per item packed into 64-bit words. Reads never mutate any
//! state, so a bit array can be scanned by many threads at once.

use super::BitmapBackend;
use crate::error::{Ext2Error, Result};

const WORD_BITS: u64 = 64;

/// Flat bit array
///
/// Bits past `bits` in the last word are always clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitArray {
    /// Bitmap words (each word = 64 items)
    words: Vec<u64>,

    /// Number of addressable bits
    bits: u64,
}

fn words_for(bits: u64) -> Result<usize> {
    usize::try_from(bits.div_ceil(WORD_BITS)).map_err(|_| Ext2Error::NoMemory)
}

fn split(bit: u64) -> (usize, u64) {
    ((bit / WORD_BITS) as usize, bit % WORD_BITS)
}

/// Mask of `n` bits starting at `off` within one word (`off + n <= 64`).
fn word_mask(off: u64, n: u64) -> u64 {
    if n == WORD_BITS {
        u64::MAX
    } else {
        ((1u64 << n) - 1) << off
    }
}

impl BitArray {
    /// Number of words backing the array
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    fn apply_range(&mut self, bit: u64, len: u64, set: bool) {
        let end = bit + len;
        let mut pos = bit;
        while pos < end {
            let (w, off) = split(pos);
            let n = (WORD_BITS - off).min(end - pos);
            let mask = word_mask(off, n);
            if set {
                self.words[w] |= mask;
            } else {
                self.words[w] &= !mask;
            }
            pos += n;
        }
    }

    /// Up to 8 bits starting at `pos`, LSB first.
    fn extract_byte(&self, pos: u64, n: u64) -> u8 {
        let (w, off) = split(pos);
        let mut v = self.words[w] >> off;
        if off > WORD_BITS - 8 && w + 1 < self.words.len() {
            v |= self.words[w + 1] << (WORD_BITS - off);
        }
        (v & ((1u64 << n) - 1)) as u8
    }

    fn find_first(&self, lo: u64, hi: u64, want_set: bool) -> Option<u64> {
        let mut pos = lo;
        while pos <= hi {
            let (w, off) = split(pos);
            let word = if want_set {
                self.words[w]
            } else {
                !self.words[w]
            };
            let shifted = word >> off;
            if shifted != 0 {
                let found = pos + u64::from(shifted.trailing_zeros());
                return (found <= hi).then_some(found);
            }
            pos = (w as u64 + 1) * WORD_BITS;
        }
        None
    }
}

impl BitmapBackend for BitArray {
    fn with_bits(bits: u64) -> Result<Self> {
        let num_words = words_for(bits)?;
        let mut words = Vec::new();
        words
            .try_reserve_exact(num_words)
            .map_err(|_| Ext2Error::NoMemory)?;
        words.resize(num_words, 0u64);
        Ok(BitArray { words, bits })
    }

    fn try_clone(&self) -> Result<Self> {
        let mut words = Vec::new();
        words
            .try_reserve_exact(self.words.len())
            .map_err(|_| Ext2Error::NoMemory)?;
        words.extend_from_slice(&self.words);
        Ok(BitArray {
            words,
            bits: self.bits,
        })
    }

    fn mark(&mut self, bit: u64) -> bool {
        let (w, off) = split(bit);
        let mask = 1u64 << off;
        let old = self.words[w] & mask != 0;
        self.words[w] |= mask;
        old
    }

    fn unmark(&mut self, bit: u64) -> bool {
        let (w, off) = split(bit);
        let mask = 1u64 << off;
        let old = self.words[w] & mask != 0;
        self.words[w] &= !mask;
        old
    }

    fn test(&self, bit: u64) -> bool {
        let (w, off) = split(bit);
        self.words[w] & (1u64 << off) != 0
    }

    fn mark_range(&mut self, bit: u64, len: u64) {
        self.apply_range(bit, len, true);
    }

    fn unmark_range(&mut self, bit: u64, len: u64) {
        self.apply_range(bit, len, false);
    }

    fn test_clear_range(&self, bit: u64, len: u64) -> bool {
        let end = bit + len;
        let mut pos = bit;
        while pos < end {
            let (w, off) = split(pos);
            let n = (WORD_BITS - off).min(end - pos);
            if self.words[w] & word_mask(off, n) != 0 {
                return false;
            }
            pos += n;
        }
        true
    }

    fn get_range(&self, bit: u64, len: u64, out: &mut [u8]) {
        let mut done = 0u64;
        let mut byte = 0usize;
        while done < len {
            let n = (len - done).min(8);
            out[byte] = self.extract_byte(bit + done, n);
            done += n;
            byte += 1;
        }
    }

    fn set_range(&mut self, bit: u64, len: u64, input: &[u8]) {
        for i in 0..len {
            let set = (input[(i / 8) as usize] >> (i % 8)) & 1 == 1;
            if set {
                self.mark(bit + i);
            } else {
                self.unmark(bit + i);
            }
        }
    }

    fn find_first_set(&self, lo: u64, hi: u64) -> Option<u64> {
        self.find_first(lo, hi, true)
    }

    fn find_first_zero(&self, lo: u64, hi: u64) -> Option<u64> {
        self.find_first(lo, hi, false)
    }

    fn for_each_run<F: FnMut(u64, u64)>(&self, lo: u64, hi: u64, mut f: F) {
        let mut pos = lo;
        while pos <= hi {
            let Some(start) = self.find_first(pos, hi, true) else {
                break;
            };
            let end = self.find_first(start, hi, false).unwrap_or(hi + 1);
            f(start, end - start);
            pos = end;
        }
    }

    fn count_set(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    fn resize(&mut self, new_bits: u64) -> Result<()> {
        let new_words = words_for(new_bits)?;
        if new_words > self.words.len() {
            self.words
                .try_reserve_exact(new_words - self.words.len())
                .map_err(|_| Ext2Error::NoMemory)?;
        }
        self.words.resize(new_words, 0u64);

        // Keep the tail of the last word clear
        let tail = new_bits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        self.bits = new_bits;
        Ok(())
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    fn bits(&self) -> u64 {
        self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitarray_creation() {
        let arr = BitArray::with_bits(1000).unwrap();
        assert_eq!(arr.bits(), 1000);
        assert_eq!(arr.word_count(), 16);
        assert_eq!(arr.count_set(), 0);
    }

    #[test]
    fn test_mark_returns_previous() {
        let mut arr = BitArray::with_bits(128).unwrap();

        assert!(!arr.mark(70));
        assert!(arr.mark(70));
        assert!(arr.test(70));
        assert!(arr.unmark(70));
        assert!(!arr.unmark(70));
        assert!(!arr.test(70));
    }

    #[test]
    fn test_range_across_words() {
        let mut arr = BitArray::with_bits(300).unwrap();

        arr.mark_range(60, 80);
        assert_eq!(arr.count_set(), 80);
        assert!(!arr.test(59));
        assert!(arr.test(60));
        assert!(arr.test(139));
        assert!(!arr.test(140));

        assert!(!arr.test_clear_range(0, 61));
        assert!(arr.test_clear_range(0, 60));
        assert!(arr.test_clear_range(140, 160));

        arr.unmark_range(64, 64);
        assert_eq!(arr.count_set(), 16);
    }

    #[test]
    fn test_get_range_lsb_first() {
        let mut arr = BitArray::with_bits(64).unwrap();
        arr.mark(0);
        arr.mark(3);
        arr.mark(9);

        let mut out = [0u8; 2];
        arr.get_range(0, 16, &mut out);
        assert_eq!(out, [0b0000_1001, 0b0000_0010]);

        // Unaligned start straddling a word
        let mut arr = BitArray::with_bits(192).unwrap();
        arr.mark(62);
        arr.mark(65);
        let mut out = [0u8; 1];
        arr.get_range(60, 8, &mut out);
        assert_eq!(out, [0b0010_0100]);
    }

    #[test]
    fn test_find_first() {
        let mut arr = BitArray::with_bits(500).unwrap();
        arr.mark_range(0, 130);
        arr.mark(400);

        assert_eq!(arr.find_first_zero(0, 499), Some(130));
        assert_eq!(arr.find_first_set(130, 499), Some(400));
        assert_eq!(arr.find_first_set(130, 399), None);
        assert_eq!(arr.find_first_zero(0, 129), None);
    }

    #[test]
    fn test_runs() {
        let mut arr = BitArray::with_bits(256).unwrap();
        arr.mark_range(10, 5);
        arr.mark_range(63, 3);
        arr.mark(255);

        let mut runs = Vec::new();
        arr.for_each_run(0, 255, |s, n| runs.push((s, n)));
        assert_eq!(runs, vec![(10, 5), (63, 3), (255, 1)]);

        runs.clear();
        arr.for_each_run(12, 64, |s, n| runs.push((s, n)));
        assert_eq!(runs, vec![(12, 3), (63, 2)]);
    }

    #[test]
    fn test_resize_clears_tail() {
        let mut arr = BitArray::with_bits(128).unwrap();
        arr.mark_range(0, 128);
        arr.resize(70).unwrap();
        assert_eq!(arr.count_set(), 70);
        arr.resize(200).unwrap();
        assert_eq!(arr.count_set(), 70);
        assert!(!arr.test(100));
    }
}
