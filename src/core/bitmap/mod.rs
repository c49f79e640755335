//! Generic 64-bit bitmaps for block and inode allocation state
//!
//! A [`Bitmap`] covers the inclusive domain `[start, end]`; storage extends
//! to `real_end` so that per-group bitmap blocks can be read and written
//! whole. Two storage strategies implement the same contract:
//!
//! - [`BackendType::BitArray`] - flat words, constant-time access, safe to
//!   read from many threads at once
//! - [`BackendType::RbTree`] - coalesced extents with a read cursor, compact
//!   for clustered maps, **not** suitable as a bitmap read concurrently by
//!   several threads (see [`rbtree`])
//!
//! Operations that combine bitmaps (`compare`, `merge_into`) work on bit
//! values only, so the two sides may use different backends.

pub mod bitarray;
pub mod rbtree;

use crate::error::{Ext2Error, Magic, MismatchKind, Result};
use crate::fs::FsId;
use bitarray::BitArray;
use rbtree::RbTree;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Storage operations every backend provides
///
/// All bit numbers are relative to the bitmap start and already range
/// checked by [`Bitmap`].
pub(crate) trait BitmapBackend: Sized {
    fn with_bits(bits: u64) -> Result<Self>;
    fn try_clone(&self) -> Result<Self>;
    fn mark(&mut self, bit: u64) -> bool;
    fn unmark(&mut self, bit: u64) -> bool;
    fn test(&self, bit: u64) -> bool;
    fn mark_range(&mut self, bit: u64, len: u64);
    fn unmark_range(&mut self, bit: u64, len: u64);
    fn test_clear_range(&self, bit: u64, len: u64) -> bool;
    fn get_range(&self, bit: u64, len: u64, out: &mut [u8]);
    fn set_range(&mut self, bit: u64, len: u64, input: &[u8]);
    fn find_first_set(&self, lo: u64, hi: u64) -> Option<u64>;
    fn find_first_zero(&self, lo: u64, hi: u64) -> Option<u64>;
    /// Visit every run of set bits clipped to `[lo, hi]` as `(start, len)`.
    fn for_each_run<F: FnMut(u64, u64)>(&self, lo: u64, hi: u64, f: F);
    fn count_set(&self) -> u64;
    fn resize(&mut self, new_bits: u64) -> Result<()>;
    fn clear(&mut self);
    fn bits(&self) -> u64;
}

/// Bitmap storage strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    BitArray,
    #[default]
    RbTree,
}

#[derive(Debug, Clone)]
enum Backend {
    BitArray(BitArray),
    RbTree(RbTree),
}

macro_rules! with_backend {
    ($bmap:expr, $b:ident => $body:expr) => {
        match &$bmap.backend {
            Backend::BitArray($b) => $body,
            Backend::RbTree($b) => $body,
        }
    };
}

macro_rules! with_backend_mut {
    ($bmap:expr, $b:ident => $body:expr) => {
        match &mut $bmap.backend {
            Backend::BitArray($b) => $body,
            Backend::RbTree($b) => $body,
        }
    };
}

/// Result of comparing two bitmaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Differs(MismatchKind),
}

impl Comparison {
    pub fn is_equal(&self) -> bool {
        matches!(self, Comparison::Equal)
    }

    /// Turn a difference into [`Ext2Error::BitmapDiffers`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Comparison::Equal => Ok(()),
            Comparison::Differs(kind) => Err(Ext2Error::BitmapDiffers(kind)),
        }
    }
}

/// A block, inode or generic bitmap
#[derive(Debug, Clone)]
pub struct Bitmap {
    magic: Magic,
    start: u64,
    end: u64,
    real_end: u64,
    description: String,
    /// Handle this bitmap belongs to; diagnostics only.
    owner: Option<FsId>,
    backend: Backend,
}

impl Bitmap {
    /// Allocate an all-clear bitmap over `[start, end]` with storage up to
    /// `real_end`.
    pub fn new(
        magic: Magic,
        backend: BackendType,
        start: u64,
        end: u64,
        real_end: u64,
        description: impl Into<String>,
    ) -> Result<Self> {
        if !matches!(
            magic,
            Magic::GenericBitmap | Magic::BlockBitmap | Magic::InodeBitmap
        ) {
            return Err(Ext2Error::MagicMismatch {
                expected: Magic::GenericBitmap,
                found: magic,
            });
        }
        if start > end || end > real_end || real_end == u64::MAX {
            return Err(Ext2Error::InvalidDomain {
                start,
                end,
                real_end,
            });
        }

        let bits = real_end - start + 1;
        let backend = match backend {
            BackendType::BitArray => Backend::BitArray(BitArray::with_bits(bits)?),
            BackendType::RbTree => Backend::RbTree(RbTree::with_bits(bits)?),
        };

        Ok(Bitmap {
            magic,
            start,
            end,
            real_end,
            description: description.into(),
            owner: None,
            backend,
        })
    }

    /// Allocate a generic bitmap over `[start, end]`.
    pub fn generic(
        backend: BackendType,
        start: u64,
        end: u64,
        description: impl Into<String>,
    ) -> Result<Self> {
        Self::new(Magic::GenericBitmap, backend, start, end, end, description)
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn real_end(&self) -> u64 {
        self.real_end
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn owner(&self) -> Option<FsId> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Option<FsId>) {
        self.owner = owner;
    }

    /// Number of items backed by storage (`real_end - start + 1`).
    pub fn capacity(&self) -> u64 {
        with_backend!(self, b => b.bits())
    }

    pub fn backend_type(&self) -> BackendType {
        match self.backend {
            Backend::BitArray(_) => BackendType::BitArray,
            Backend::RbTree(_) => BackendType::RbTree,
        }
    }

    /// Whether several threads may read this bitmap at the same time.
    ///
    /// Only bit arrays qualify: the interval tree's read cursor is written
    /// by every lookup.
    pub fn supports_shared_scan(&self) -> bool {
        matches!(self.backend, Backend::BitArray(_))
    }

    fn mismatch_kind(&self) -> MismatchKind {
        match self.magic {
            Magic::BlockBitmap => MismatchKind::BlockBitmap,
            Magic::InodeBitmap => MismatchKind::InodeBitmap,
            _ => MismatchKind::GenericBitmap,
        }
    }

    fn range_error(&self, index: u64) -> Ext2Error {
        tracing::debug!(
            "{}: index {} outside {}..={} (owner {:?})",
            self.description,
            index,
            self.start,
            self.end,
            self.owner
        );
        Ext2Error::BitmapRange {
            kind: self.magic,
            index,
            start: self.start,
            end: self.end,
        }
    }

    fn check_index(&self, index: u64) -> Result<u64> {
        if index < self.start || index > self.end {
            return Err(self.range_error(index));
        }
        Ok(index - self.start)
    }

    /// Check `count` items from `index` fit below `limit`.
    fn check_span(&self, index: u64, count: u64, limit: u64) -> Result<u64> {
        if index < self.start {
            return Err(self.range_error(index));
        }
        if count > 0 {
            let last = index
                .checked_add(count - 1)
                .ok_or_else(|| self.range_error(u64::MAX))?;
            if last > limit {
                return Err(self.range_error(last));
            }
        }
        Ok(index - self.start)
    }

    /// Set one bit, returning its previous value.
    pub fn mark(&mut self, index: u64) -> Result<bool> {
        let bit = self.check_index(index)?;
        Ok(with_backend_mut!(self, b => b.mark(bit)))
    }

    /// Clear one bit, returning its previous value.
    pub fn unmark(&mut self, index: u64) -> Result<bool> {
        let bit = self.check_index(index)?;
        Ok(with_backend_mut!(self, b => b.unmark(bit)))
    }

    pub fn test(&self, index: u64) -> Result<bool> {
        let bit = self.check_index(index)?;
        Ok(with_backend!(self, b => b.test(bit)))
    }

    pub fn mark_range(&mut self, index: u64, count: u64) -> Result<()> {
        let bit = self.check_span(index, count, self.end)?;
        with_backend_mut!(self, b => b.mark_range(bit, count));
        Ok(())
    }

    pub fn unmark_range(&mut self, index: u64, count: u64) -> Result<()> {
        let bit = self.check_span(index, count, self.end)?;
        with_backend_mut!(self, b => b.unmark_range(bit, count));
        Ok(())
    }

    /// True when no bit in `[index, index + count)` is set.
    pub fn test_clear_range(&self, index: u64, count: u64) -> Result<bool> {
        let bit = self.check_span(index, count, self.end)?;
        Ok(with_backend!(self, b => b.test_clear_range(bit, count)))
    }

    /// Export `count` items from `index` into `out`, one bit per item,
    /// LSB-first within each byte.
    pub fn get_range(&self, index: u64, count: u64, out: &mut [u8]) -> Result<()> {
        let bit = self.check_span(index, count, self.real_end)?;
        let needed = count.div_ceil(8) as usize;
        if out.len() < needed {
            return Err(Ext2Error::BufferTooSmall {
                needed,
                got: out.len(),
            });
        }
        if count > 0 {
            with_backend!(self, b => b.get_range(bit, count, out));
        }
        Ok(())
    }

    /// Import `count` items from `index`, the inverse of [`get_range`](Self::get_range).
    pub fn set_range(&mut self, index: u64, count: u64, input: &[u8]) -> Result<()> {
        let bit = self.check_span(index, count, self.real_end)?;
        let needed = count.div_ceil(8) as usize;
        if input.len() < needed {
            return Err(Ext2Error::BufferTooSmall {
                needed,
                got: input.len(),
            });
        }
        with_backend_mut!(self, b => b.set_range(bit, count, input));
        Ok(())
    }

    /// First set item in `[lo, hi]`.
    pub fn find_first_set(&self, lo: u64, hi: u64) -> Result<Option<u64>> {
        let lo_bit = self.check_index(lo)?;
        let hi_bit = self.check_index(hi)?;
        if lo_bit > hi_bit {
            return Ok(None);
        }
        Ok(with_backend!(self, b => b.find_first_set(lo_bit, hi_bit)).map(|bit| bit + self.start))
    }

    /// First clear item in `[lo, hi]`.
    pub fn find_first_zero(&self, lo: u64, hi: u64) -> Result<Option<u64>> {
        let lo_bit = self.check_index(lo)?;
        let hi_bit = self.check_index(hi)?;
        if lo_bit > hi_bit {
            return Ok(None);
        }
        Ok(with_backend!(self, b => b.find_first_zero(lo_bit, hi_bit)).map(|bit| bit + self.start))
    }

    /// Number of set items in `[start, end]`.
    pub fn count_set(&self) -> u64 {
        if self.end == self.real_end {
            return with_backend!(self, b => b.count_set());
        }
        let mut total = 0;
        self.for_each_run(self.start, self.end, |_, n| total += n);
        total
    }

    /// Visit runs of set items in `[lo, hi]` (absolute, clipped to the
    /// allocated range).
    pub(crate) fn for_each_run<F: FnMut(u64, u64)>(&self, lo: u64, hi: u64, mut f: F) {
        let lo = lo.max(self.start);
        let hi = hi.min(self.real_end);
        if lo > hi {
            return;
        }
        let base = self.start;
        with_backend!(self, b => b.for_each_run(lo - base, hi - base, |s, n| f(s + base, n)));
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        with_backend_mut!(self, b => b.clear());
    }

    /// Change the logical and physical end. Bits past the new physical end
    /// are discarded; new bits start clear.
    pub fn resize(&mut self, new_end: u64, new_real_end: u64) -> Result<()> {
        if new_end < self.start || new_end > new_real_end || new_real_end == u64::MAX {
            return Err(Ext2Error::InvalidDomain {
                start: self.start,
                end: new_end,
                real_end: new_real_end,
            });
        }
        // Bits hidden past the old logical end may still be set
        if new_end > self.end {
            let hi = new_end.min(self.real_end);
            if hi > self.end {
                let (from, len) = (self.end + 1 - self.start, hi - self.end);
                with_backend_mut!(self, b => b.unmark_range(from, len));
            }
        }
        let bits = new_real_end - self.start + 1;
        with_backend_mut!(self, b => b.resize(bits))?;
        self.end = new_end;
        self.real_end = new_real_end;
        Ok(())
    }

    /// Independent copy with the same backend, domain and bits.
    pub fn copy(&self) -> Result<Bitmap> {
        let backend = match &self.backend {
            Backend::BitArray(b) => Backend::BitArray(b.try_clone()?),
            Backend::RbTree(b) => Backend::RbTree(b.try_clone()?),
        };
        Ok(Bitmap {
            magic: self.magic,
            start: self.start,
            end: self.end,
            real_end: self.real_end,
            description: format!("copy of {}", self.description),
            owner: self.owner,
            backend,
        })
    }

    /// Compare domain and bit values over `[start, end]`.
    ///
    /// Bitmaps of different kinds cannot be compared.
    pub fn compare(&self, other: &Bitmap) -> Result<Comparison> {
        Ext2Error::check_magic(self.magic, other.magic)?;
        let differs = Comparison::Differs(self.mismatch_kind());

        if self.start != other.start || self.end != other.end {
            return Ok(differs);
        }

        // Same geometry, both flat: compare words directly
        if let (Backend::BitArray(a), Backend::BitArray(b)) = (&self.backend, &other.backend) {
            if self.real_end == other.real_end && self.end == self.real_end {
                return Ok(if a == b { Comparison::Equal } else { differs });
            }
        }

        let mut ours = Vec::new();
        let mut theirs = Vec::new();
        self.for_each_run(self.start, self.end, |s, n| ours.push((s, n)));
        other.for_each_run(other.start, other.end, |s, n| theirs.push((s, n)));

        Ok(if ours == theirs {
            Comparison::Equal
        } else {
            differs
        })
    }

    /// OR every set bit of `self` (optionally limited to the inclusive
    /// `bounds`) into `dest`.
    ///
    /// Nothing is modified if a set bit would fall outside `dest`'s domain.
    pub fn merge_into(&self, dest: &mut Bitmap, bounds: Option<(u64, u64)>) -> Result<()> {
        Ext2Error::check_magic(dest.magic, self.magic)?;

        let (lo, hi) = match bounds {
            Some((lo, hi)) => (lo.max(self.start), hi.min(self.end)),
            None => (self.start, self.end),
        };
        if lo > hi {
            return Ok(());
        }

        let mut runs = Vec::new();
        self.for_each_run(lo, hi, |s, n| runs.push((s, n)));

        if let (Some(&(first, _)), Some(&(last_start, last_len))) = (runs.first(), runs.last()) {
            let last = last_start + last_len - 1;
            if first < dest.start {
                return Err(dest.range_error(first));
            }
            if last > dest.end {
                return Err(dest.range_error(last));
            }
        }

        let base = dest.start;
        with_backend_mut!(dest, b => {
            for &(s, n) in &runs {
                b.mark_range(s - base, n);
            }
        });

        tracing::trace!(
            "merged {} runs from {} into {}",
            runs.len(),
            self.description,
            dest.description
        );
        Ok(())
    }

    /// Hex dump of `[start, end]`, most significant byte first, followed by
    /// the number of set bits.
    pub fn dump_hex(&self) -> Result<String> {
        let count = self.end - self.start + 1;
        let mut buf = vec![0u8; count.div_ceil(8) as usize];
        self.get_range(self.start, count, &mut buf)?;

        let mut out = String::with_capacity(buf.len() * 3 + 24);
        for byte in buf.iter().rev() {
            let _ = write!(out, "{:02x} ", byte);
        }
        let set: u32 = buf.iter().map(|b| b.count_ones()).sum();
        let _ = write!(out, "\nbits set: {}", set);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both() -> [BackendType; 2] {
        [BackendType::BitArray, BackendType::RbTree]
    }

    #[test]
    fn test_mark_test_relative_to_start() {
        for backend in both() {
            let mut bmap = Bitmap::new(Magic::BlockBitmap, backend, 1, 127, 128, "block bitmap").unwrap();

            assert!(!bmap.mark(1).unwrap());
            assert!(bmap.mark(1).unwrap());
            assert!(bmap.test(1).unwrap());
            assert!(!bmap.test(2).unwrap());
            assert!(bmap.mark(127).is_ok());
        }
    }

    #[test]
    fn test_out_of_range_is_an_error() {
        for backend in both() {
            let mut bmap = Bitmap::new(Magic::BlockBitmap, backend, 1, 127, 128, "block bitmap").unwrap();

            assert!(matches!(
                bmap.mark(0),
                Err(Ext2Error::BitmapRange { index: 0, start: 1, end: 127, .. })
            ));
            // Above `end` even though storage reaches `real_end`
            assert!(matches!(bmap.test(128), Err(Ext2Error::BitmapRange { index: 128, .. })));
            assert!(matches!(bmap.unmark(u64::MAX), Err(Ext2Error::BitmapRange { .. })));
            assert!(matches!(bmap.mark_range(120, 10), Err(Ext2Error::BitmapRange { .. })));
            assert_eq!(bmap.count_set(), 0);
        }
    }

    #[test]
    fn test_invalid_domain_and_magic() {
        assert!(matches!(
            Bitmap::new(Magic::BlockBitmap, BackendType::BitArray, 10, 5, 20, "bad"),
            Err(Ext2Error::InvalidDomain { .. })
        ));
        assert!(matches!(
            Bitmap::new(Magic::Filesystem, BackendType::BitArray, 0, 5, 5, "bad"),
            Err(Ext2Error::MagicMismatch { .. })
        ));
    }

    #[test]
    fn test_get_range_packing() {
        for backend in both() {
            let mut bmap = Bitmap::generic(backend, 0, 31, "generic").unwrap();
            for i in [0, 2, 8, 15, 16] {
                bmap.mark(i).unwrap();
            }

            let mut buf = [0u8; 3];
            bmap.get_range(0, 17, &mut buf).unwrap();
            assert_eq!(buf, [0b0000_0101, 0b1000_0001, 0b0000_0001]);

            let mut small = [0u8; 2];
            assert!(matches!(
                bmap.get_range(0, 17, &mut small),
                Err(Ext2Error::BufferTooSmall { needed: 3, got: 2 })
            ));
        }
    }

    #[test]
    fn test_copy_is_independent() {
        let blocks = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 21, 23, 26, 29, 33, 37, 38];
        for backend in both() {
            let mut bmap = Bitmap::new(Magic::BlockBitmap, backend, 1, 126, 126, "block bitmap").unwrap();
            for &b in &blocks {
                bmap.mark(b).unwrap();
            }

            let copy = bmap.copy().unwrap();
            assert_eq!(copy.backend_type(), backend);
            assert!(bmap.compare(&copy).unwrap().is_equal());

            bmap.mark(100).unwrap();
            assert!(!copy.test(100).unwrap());
            assert_eq!(
                bmap.compare(&copy).unwrap(),
                Comparison::Differs(MismatchKind::BlockBitmap)
            );
        }
    }

    #[test]
    fn test_merge_odd_even() {
        let odd = [1, 3, 5, 7, 9, 21, 23, 29, 33, 37];
        let even = [2, 4, 6, 8, 10, 26, 38];

        for backend in both() {
            let mut map1 = Bitmap::new(Magic::BlockBitmap, backend, 1, 126, 126, "block bitmap 1").unwrap();
            let mut map2 = Bitmap::new(Magic::BlockBitmap, backend, 1, 126, 126, "block bitmap 2").unwrap();
            let mut expected = Bitmap::new(Magic::BlockBitmap, BackendType::BitArray, 1, 126, 126, "expected").unwrap();

            for &b in &odd {
                map1.mark(b).unwrap();
                expected.mark(b).unwrap();
            }
            for &b in &even {
                map2.mark(b).unwrap();
                expected.mark(b).unwrap();
            }

            map2.merge_into(&mut map1, None).unwrap();
            assert!(map1.compare(&expected).unwrap().is_equal());
            assert_eq!(map2.count_set(), even.len() as u64);

            // Idempotent
            map2.merge_into(&mut map1, None).unwrap();
            assert!(map1.compare(&expected).unwrap().is_equal());
        }
    }

    #[test]
    fn test_merge_bounds_and_dest_domain() {
        let mut src = Bitmap::generic(BackendType::RbTree, 0, 99, "src").unwrap();
        src.mark_range(10, 80).unwrap();

        let mut dest = Bitmap::generic(BackendType::BitArray, 0, 99, "dest").unwrap();
        src.merge_into(&mut dest, Some((20, 29))).unwrap();
        assert_eq!(dest.count_set(), 10);
        assert_eq!(dest.find_first_set(0, 99).unwrap(), Some(20));

        let mut narrow = Bitmap::generic(BackendType::BitArray, 0, 49, "narrow").unwrap();
        assert!(matches!(
            src.merge_into(&mut narrow, None),
            Err(Ext2Error::BitmapRange { index: 89, .. })
        ));
        assert_eq!(narrow.count_set(), 0);
    }

    #[test]
    fn test_compare_across_backends_and_kinds() {
        let mut flat = Bitmap::new(Magic::InodeBitmap, BackendType::BitArray, 1, 64, 64, "flat").unwrap();
        let mut tree = Bitmap::new(Magic::InodeBitmap, BackendType::RbTree, 1, 64, 64, "tree").unwrap();
        flat.mark(7).unwrap();
        tree.mark(7).unwrap();
        assert_eq!(flat.compare(&tree).unwrap(), Comparison::Equal);

        tree.mark(8).unwrap();
        let result = flat.compare(&tree).unwrap();
        assert_eq!(result, Comparison::Differs(MismatchKind::InodeBitmap));
        assert!(matches!(
            result.into_result(),
            Err(Ext2Error::BitmapDiffers(MismatchKind::InodeBitmap))
        ));

        let block = Bitmap::new(Magic::BlockBitmap, BackendType::BitArray, 1, 64, 64, "block").unwrap();
        assert!(matches!(flat.compare(&block), Err(Ext2Error::MagicMismatch { .. })));

        let wider = Bitmap::new(Magic::InodeBitmap, BackendType::BitArray, 1, 65, 65, "wider").unwrap();
        assert!(!flat.compare(&wider).unwrap().is_equal());
    }

    #[test]
    fn test_resize() {
        for backend in both() {
            let mut bmap = Bitmap::generic(backend, 0, 99, "resize").unwrap();
            bmap.mark_range(0, 100).unwrap();

            bmap.resize(49, 63).unwrap();
            assert_eq!(bmap.end(), 49);
            assert_eq!(bmap.count_set(), 50);
            assert!(bmap.test(50).is_err());

            bmap.resize(199, 199).unwrap();
            assert!(!bmap.test(120).unwrap());
        }
    }

    #[test]
    fn test_grow_after_shrink_clears_hidden_bits() {
        for backend in both() {
            let mut bmap = Bitmap::generic(backend, 0, 99, "regrow").unwrap();
            bmap.mark_range(0, 100).unwrap();
            bmap.resize(49, 63).unwrap();
            bmap.resize(199, 199).unwrap();

            assert_eq!(bmap.count_set(), 50);
            assert_eq!(bmap.find_first_set(50, 199).unwrap(), None);
            assert!(bmap.test(49).unwrap());
        }
    }

    #[test]
    fn test_grow_within_real_end_clears_padding() {
        for backend in both() {
            let mut bmap = Bitmap::new(Magic::BlockBitmap, backend, 1, 40, 63, "padded").unwrap();
            let raw = [0xffu8; 8];
            bmap.set_range(1, 63, &raw).unwrap();
            bmap.resize(50, 63).unwrap();

            assert_eq!(bmap.count_set(), 40);
            assert!(!bmap.test(45).unwrap());
        }
    }

    #[test]
    fn test_dump_hex() {
        let mut bmap = Bitmap::generic(BackendType::BitArray, 0, 15, "dump").unwrap();
        bmap.mark(0).unwrap();
        bmap.mark(9).unwrap();
        assert_eq!(bmap.dump_hex().unwrap(), "02 01 \nbits set: 2");
    }
}
