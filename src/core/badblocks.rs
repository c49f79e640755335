//! Bad block list
//!
//! A sorted, de-duplicated set of block numbers known to be unreadable.

use crate::error::{Ext2Error, Magic, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadBlocksList {
    /// Block numbers in ascending order
    list: Vec<u64>,
}

impl BadBlocksList {
    pub fn new() -> Self {
        BadBlocksList { list: Vec::new() }
    }

    pub fn magic(&self) -> Magic {
        Magic::BadBlocksList
    }

    /// Add a block, returning `false` if it was already listed.
    pub fn add(&mut self, blk: u64) -> Result<bool> {
        match self.list.binary_search(&blk) {
            Ok(_) => Ok(false),
            Err(pos) => {
                self.list.try_reserve(1).map_err(|_| Ext2Error::NoMemory)?;
                self.list.insert(pos, blk);
                Ok(true)
            }
        }
    }

    pub fn remove(&mut self, blk: u64) -> bool {
        match self.list.binary_search(&blk) {
            Ok(pos) => {
                self.list.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn test(&self, blk: u64) -> bool {
        self.list.binary_search(&blk).is_ok()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.list.iter().copied()
    }

    /// Independent deep copy.
    pub fn copy(&self) -> Result<BadBlocksList> {
        let mut list = Vec::new();
        list.try_reserve_exact(self.list.len())
            .map_err(|_| Ext2Error::NoMemory)?;
        list.extend_from_slice(&self.list);
        Ok(BadBlocksList { list })
    }

    /// Fold every block of `src` into `self`; existing entries are kept.
    pub fn merge_from(&mut self, src: &BadBlocksList) -> Result<()> {
        let mut merged = Vec::new();
        merged
            .try_reserve_exact(self.list.len() + src.list.len())
            .map_err(|_| Ext2Error::NoMemory)?;

        let (mut i, mut j) = (0, 0);
        while i < self.list.len() || j < src.list.len() {
            let ours = self.list.get(i).copied();
            let theirs = src.list.get(j).copied();
            let blk = match (ours, theirs) {
                (Some(x), Some(y)) if x < y => {
                    i += 1;
                    x
                }
                (Some(x), Some(y)) if x > y => {
                    j += 1;
                    y
                }
                (Some(x), Some(_)) => {
                    i += 1;
                    j += 1;
                    x
                }
                (Some(x), None) => {
                    i += 1;
                    x
                }
                (None, Some(y)) => {
                    j += 1;
                    y
                }
                (None, None) => break,
            };
            merged.push(blk);
        }

        self.list = merged;
        Ok(())
    }
}

impl FromIterator<u64> for BadBlocksList {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut list: Vec<u64> = iter.into_iter().collect();
        list.sort_unstable();
        list.dedup();
        BadBlocksList { list }
    }
}
