//! Interval-tree bitmap backend
//!
//! Set bits are stored as coalesced extents in a B-tree keyed by start
//! item. Sparse or highly clustered bitmaps (block maps of mostly empty or
//! mostly full filesystems) take a handful of nodes instead of one bit per
//! item.
//!
//! # Read cursor
//!
//! Every `test` remembers the last extent it hit so that sequential scans
//! skip the tree walk. The cursor is shared state written by reads: two
//! threads testing the same instance keep overwriting each other's cursor
//! and serialize on it. Results stay correct but the instance must not be
//! used as a bitmap read by several threads; use a
//! [`BitArray`](super::bitarray::BitArray) for that.

use super::BitmapBackend;
use crate::error::Result;
use crossbeam::atomic::AtomicCell;
use std::collections::BTreeMap;
use std::fmt;

/// An extent representing a contiguous range of set items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Starting item (relative to the bitmap start)
    pub start: u64,
    /// Number of contiguous items
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    /// One past the last item
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent contains an item
    pub fn contains(&self, bit: u64) -> bool {
        bit >= self.start && bit < self.end()
    }
}

/// Interval-tree bitmap
///
/// Extents never overlap and never touch: adjacent runs are coalesced on
/// insert.
pub struct RbTree {
    extents: BTreeMap<u64, Extent>,
    bits: u64,
    cursor: AtomicCell<Option<Extent>>,
}

impl fmt::Debug for RbTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RbTree")
            .field("extents", &self.extents.len())
            .field("bits", &self.bits)
            .finish()
    }
}

impl Clone for RbTree {
    fn clone(&self) -> Self {
        RbTree {
            extents: self.extents.clone(),
            bits: self.bits,
            cursor: AtomicCell::new(None),
        }
    }
}

impl RbTree {
    /// Current number of extents (fragmentation indicator)
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    /// The extent containing `bit`, if any.
    fn lookup(&self, bit: u64) -> Option<Extent> {
        self.extents
            .range(..=bit)
            .next_back()
            .map(|(_, e)| *e)
            .filter(|e| e.contains(bit))
    }

    fn reset_cursor(&mut self) {
        self.cursor.store(None);
    }

    /// Insert `[start, end)`, absorbing every extent it overlaps or touches.
    fn insert_and_coalesce(&mut self, start: u64, end: u64) {
        let mut new_start = start;
        let mut new_end = end;
        let mut to_remove = Vec::new();

        for (&key, extent) in self.extents.range(..=end).rev() {
            if extent.end() < start {
                break;
            }
            new_start = new_start.min(extent.start);
            new_end = new_end.max(extent.end());
            to_remove.push(key);
        }

        for key in to_remove {
            self.extents.remove(&key);
        }

        self.extents
            .insert(new_start, Extent::new(new_start, new_end - new_start));
        self.reset_cursor();
    }

    /// Remove `[start, end)`, splitting extents that straddle the edges.
    fn remove_span(&mut self, start: u64, end: u64) {
        let mut hit = Vec::new();
        for (&key, extent) in self.extents.range(..end).rev() {
            if extent.end() <= start {
                break;
            }
            hit.push((key, *extent));
        }

        for (key, extent) in hit {
            self.extents.remove(&key);
            if extent.start < start {
                self.extents
                    .insert(extent.start, Extent::new(extent.start, start - extent.start));
            }
            if extent.end() > end {
                self.extents
                    .insert(end, Extent::new(end, extent.end() - end));
            }
        }
        self.reset_cursor();
    }
}

impl BitmapBackend for RbTree {
    fn with_bits(bits: u64) -> Result<Self> {
        Ok(RbTree {
            extents: BTreeMap::new(),
            bits,
            cursor: AtomicCell::new(None),
        })
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(self.clone())
    }

    fn mark(&mut self, bit: u64) -> bool {
        if self.lookup(bit).is_some() {
            return true;
        }
        self.insert_and_coalesce(bit, bit + 1);
        false
    }

    fn unmark(&mut self, bit: u64) -> bool {
        if self.lookup(bit).is_none() {
            return false;
        }
        self.remove_span(bit, bit + 1);
        true
    }

    fn test(&self, bit: u64) -> bool {
        if let Some(extent) = self.cursor.load() {
            if extent.contains(bit) {
                return true;
            }
        }

        match self.lookup(bit) {
            Some(extent) => {
                self.cursor.store(Some(extent));
                true
            }
            None => false,
        }
    }

    fn mark_range(&mut self, bit: u64, len: u64) {
        if len > 0 {
            self.insert_and_coalesce(bit, bit + len);
        }
    }

    fn unmark_range(&mut self, bit: u64, len: u64) {
        if len > 0 {
            self.remove_span(bit, bit + len);
        }
    }

    fn test_clear_range(&self, bit: u64, len: u64) -> bool {
        let end = bit + len;
        // The last extent starting before `end` reaches furthest.
        match self.extents.range(..end).next_back() {
            Some((_, extent)) => extent.end() <= bit,
            None => true,
        }
    }

    fn get_range(&self, bit: u64, len: u64, out: &mut [u8]) {
        let bytes = len.div_ceil(8) as usize;
        out[..bytes].iter_mut().for_each(|b| *b = 0);
        if len == 0 {
            return;
        }
        self.for_each_run(bit, bit + len - 1, |start, n| {
            for item in start..start + n {
                let rel = item - bit;
                out[(rel / 8) as usize] |= 1 << (rel % 8);
            }
        });
    }

    fn set_range(&mut self, bit: u64, len: u64, input: &[u8]) {
        self.unmark_range(bit, len);

        let mut run_start: Option<u64> = None;
        for i in 0..len {
            let set = (input[(i / 8) as usize] >> (i % 8)) & 1 == 1;
            match (set, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(s)) => {
                    self.insert_and_coalesce(bit + s, bit + i);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            self.insert_and_coalesce(bit + s, bit + len);
        }
    }

    fn find_first_set(&self, lo: u64, hi: u64) -> Option<u64> {
        if self.lookup(lo).is_some() {
            return Some(lo);
        }
        self.extents
            .range(lo..=hi)
            .next()
            .map(|(&start, _)| start)
    }

    fn find_first_zero(&self, lo: u64, hi: u64) -> Option<u64> {
        let candidate = match self.lookup(lo) {
            Some(extent) => extent.end(),
            None => lo,
        };
        (candidate <= hi).then_some(candidate)
    }

    fn for_each_run<F: FnMut(u64, u64)>(&self, lo: u64, hi: u64, mut f: F) {
        if lo > hi {
            return;
        }
        let end = hi + 1;

        if let Some(extent) = self.lookup(lo) {
            if extent.start < lo {
                f(lo, extent.end().min(end) - lo);
            }
        }

        for (_, extent) in self.extents.range(lo..end) {
            f(extent.start, extent.end().min(end) - extent.start);
        }
    }

    fn count_set(&self) -> u64 {
        self.extents.values().map(|e| e.length).sum()
    }

    fn resize(&mut self, new_bits: u64) -> Result<()> {
        if new_bits < self.bits {
            self.remove_span(new_bits, self.bits);
        }
        self.bits = new_bits;
        Ok(())
    }

    fn clear(&mut self) {
        self.extents.clear();
        self.reset_cursor();
    }

    fn bits(&self) -> u64 {
        self.bits
    }
}
