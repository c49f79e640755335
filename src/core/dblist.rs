//! Directory block list
//!
//! Records every block that belongs to a directory so that later passes can
//! walk directory contents in disk order instead of inode order.

use crate::error::{Ext2Error, Magic, Result};
use crate::fs::FsId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One directory block: which inode owns it and where it sits in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirBlock {
    pub ino: u32,
    pub blk: u64,
    /// Logical block index inside the directory
    pub blockcnt: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirBlockList {
    list: Vec<DirBlock>,
    sorted: bool,
    #[serde(skip)]
    owner: Option<FsId>,
}

fn disk_order(a: &DirBlock, b: &DirBlock) -> Ordering {
    a.blk
        .cmp(&b.blk)
        .then(a.ino.cmp(&b.ino))
        .then(a.blockcnt.cmp(&b.blockcnt))
}

impl DirBlockList {
    pub fn new() -> Self {
        DirBlockList {
            list: Vec::new(),
            sorted: true,
            owner: None,
        }
    }

    pub fn magic(&self) -> Magic {
        Magic::DirBlockList
    }

    pub fn owner(&self) -> Option<FsId> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Option<FsId>) {
        self.owner = owner;
    }

    pub fn add(&mut self, ino: u32, blk: u64, blockcnt: i64) -> Result<()> {
        self.list.try_reserve(1).map_err(|_| Ext2Error::NoMemory)?;
        self.list.push(DirBlock { ino, blk, blockcnt });
        self.sorted = false;
        Ok(())
    }

    /// Change the physical block of an existing `(ino, blockcnt)` entry.
    pub fn set(&mut self, ino: u32, blk: u64, blockcnt: i64) -> Result<()> {
        let entry = self
            .list
            .iter_mut()
            .find(|e| e.ino == ino && e.blockcnt == blockcnt)
            .ok_or(Ext2Error::DirBlockNotFound { ino, blockcnt })?;
        entry.blk = blk;
        self.sorted = false;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&DirBlock> {
        self.list.get(index)
    }

    /// Sort entries by block number, then owning inode.
    pub fn sort(&mut self) {
        if !self.sorted {
            self.list.sort_by(disk_order);
            self.sorted = true;
        }
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirBlock> {
        self.list.iter()
    }

    /// Independent deep copy.
    pub fn copy(&self) -> Result<DirBlockList> {
        let mut list = Vec::new();
        list.try_reserve_exact(self.list.len())
            .map_err(|_| Ext2Error::NoMemory)?;
        list.extend_from_slice(&self.list);
        Ok(DirBlockList {
            list,
            sorted: self.sorted,
            owner: self.owner,
        })
    }

    /// Append the entries of `src` after the existing ones.
    pub fn merge_from(&mut self, src: &DirBlockList) -> Result<()> {
        if src.list.is_empty() {
            return Ok(());
        }
        self.list
            .try_reserve(src.list.len())
            .map_err(|_| Ext2Error::NoMemory)?;
        self.list.extend_from_slice(&src.list);
        self.sorted = false;
        Ok(())
    }

    /// Same entries regardless of order.
    pub fn same_entries(&self, other: &DirBlockList) -> bool {
        if self.list.len() != other.list.len() {
            return false;
        }
        let mut ours = self.list.clone();
        let mut theirs = other.list.clone();
        ours.sort_by(disk_order);
        theirs.sort_by(disk_order);
        ours == theirs
    }
}
