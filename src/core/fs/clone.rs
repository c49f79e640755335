//! Clone and merge for parallel scans
//!
//! A clone shares the superblock, descriptors, channels, MMP buffers and
//! private data with its parent and privately owns a copy of each
//! structure selected by its [`CloneFlags`]. Each worker thread fills its
//! clone's private structures; [`Filesystem::merge_fs`] then folds them
//! back into the parent and consumes the clone.

use super::{FsFlags, FsId, Filesystem};
use crate::bitmap::Bitmap;
use crate::error::{Ext2Error, Result};
use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

bitflags! {
    /// Structures a clone owns privately
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CloneFlags: u32 {
        const INODE = 0x1;
        const BLOCK = 0x2;
        const BADBLOCKS = 0x4;
        const DBLIST = 0x8;
    }
}

/// Outstanding-children counter of one handle
#[derive(Debug, Default)]
pub(crate) struct RefCount {
    count: Mutex<i64>,
}

impl RefCount {
    pub(crate) fn new() -> Self {
        RefCount {
            count: Mutex::new(0),
        }
    }

    pub(crate) fn get(&self) -> i64 {
        *self.count.lock()
    }

    fn acquire(&self) {
        *self.count.lock() += 1;
    }

    /// Panics if the count would go negative.
    fn release(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        assert!(*count >= 0, "clone reference count underflow ({})", *count);
    }
}

/// Proof that a handle is an unmerged clone of some parent
///
/// Holding the token keeps the parent's child count raised; dropping it,
/// whether by merge, by dropping the clone or by a failed clone, lowers it.
#[derive(Debug)]
pub struct CloneToken {
    counter: Arc<RefCount>,
    parent: FsId,
}

impl CloneToken {
    fn new(counter: &Arc<RefCount>, parent: FsId) -> Self {
        counter.acquire();
        CloneToken {
            counter: Arc::clone(counter),
            parent,
        }
    }

    pub fn parent(&self) -> FsId {
        self.parent
    }
}

impl Drop for CloneToken {
    fn drop(&mut self) {
        self.counter.release();
    }
}

/// Private copy of `src` for a clone, or a shared reference.
fn split<T>(
    src: &Option<Arc<T>>,
    private: bool,
    copy: impl FnOnce(&T) -> Result<T>,
) -> Result<Option<Arc<T>>> {
    match src {
        Some(shared) if private => Ok(Some(Arc::new(copy(shared)?))),
        other => Ok(other.clone()),
    }
}

/// Fold a clone's bitmap into the parent's slot.
fn absorb_bitmap(slot: &mut Option<Arc<Bitmap>>, src: Arc<Bitmap>, owner: FsId) -> Result<()> {
    match slot {
        None => {
            let mut map = Arc::try_unwrap(src).or_else(|shared| shared.copy())?;
            map.set_owner(Some(owner));
            *slot = Some(Arc::new(map));
        }
        Some(dest) => {
            let dest = Arc::make_mut(dest);
            src.merge_into(dest, None)?;
            dest.set_owner(Some(owner));
        }
    }
    Ok(())
}

impl Filesystem {
    /// Create a child handle for a worker thread.
    ///
    /// Structures named in `flags` are copied for the child; the rest stay
    /// shared with `self` and are read-only from the child. The child's
    /// inode cache starts empty.
    pub fn clone_fs(&self, flags: CloneFlags) -> Result<Filesystem> {
        // Raises our child count now; dropped again if a copy below fails
        let token = CloneToken::new(&self.children, self.id);
        let id = FsId::next();

        let mut inode_map = split(&self.inode_map, flags.contains(CloneFlags::INODE), |m| m.copy())?;
        let mut block_map = split(&self.block_map, flags.contains(CloneFlags::BLOCK), |m| m.copy())?;
        let badblocks = split(&self.badblocks, flags.contains(CloneFlags::BADBLOCKS), |l| l.copy())?;
        let mut dblist = split(&self.dblist, flags.contains(CloneFlags::DBLIST), |l| l.copy())?;

        for map in [&mut inode_map, &mut block_map] {
            if let Some(map) = map.as_mut().and_then(Arc::get_mut) {
                map.set_owner(Some(id));
            }
        }
        if let Some(list) = dblist.as_mut().and_then(Arc::get_mut) {
            list.set_owner(Some(id));
        }

        debug!("{}: cloned {} with {:?}", self.id, id, flags);

        Ok(Filesystem {
            id,
            device_name: self.device_name.clone(),
            flags: self.flags,
            block_size: self.block_size,
            group_desc_count: self.group_desc_count,
            desc_blocks: self.desc_blocks,
            inode_blocks_per_group: self.inode_blocks_per_group,
            super_block: Arc::clone(&self.super_block),
            orig_super: Arc::clone(&self.orig_super),
            group_desc: Arc::clone(&self.group_desc),
            inode_map,
            block_map,
            badblocks,
            dblist,
            io: self.io.clone(),
            image_io: self.image_io.clone(),
            icache: None,
            icache_size: self.icache_size,
            mmp: self.mmp.clone(),
            priv_data: self.priv_data.clone(),
            default_bitmap_type: self.default_bitmap_type,
            clone_flags: flags,
            parent: Some(token),
            children: Arc::new(RefCount::new()),
        })
    }

    /// Fold a clone back into `self` and destroy it.
    ///
    /// The child's private structures are adopted where `self` has none and
    /// merged into `self`'s copy otherwise. `self` keeps its own channels,
    /// inode cache and private data. The child is consumed even when an
    /// error is returned.
    pub fn merge_fs(&mut self, mut child: Filesystem) -> Result<()> {
        let token = match child.parent.take() {
            Some(token) if token.parent() == self.id => token,
            other => {
                child.parent = other;
                return Err(Ext2Error::NotAChild);
            }
        };
        drop(token);

        let flags = child.clone_flags;
        let parent_flags = self.flags;

        self.device_name = std::mem::take(&mut child.device_name);
        self.block_size = child.block_size;
        self.group_desc_count = child.group_desc_count;
        self.desc_blocks = child.desc_blocks;
        self.inode_blocks_per_group = child.inode_blocks_per_group;
        self.super_block = Arc::clone(&child.super_block);
        self.orig_super = Arc::clone(&child.orig_super);
        self.group_desc = Arc::clone(&child.group_desc);
        self.mmp = child.mmp.clone();
        self.default_bitmap_type = child.default_bitmap_type;

        self.flags = child.flags | parent_flags;
        if !child.flags.contains(FsFlags::VALID) || !parent_flags.contains(FsFlags::VALID) {
            self.flags.remove(FsFlags::VALID);
        }

        let result = self.absorb(&mut child, flags);
        if let Err(e) = &result {
            debug!("{}: merge of {} failed: {}", self.id, child.id, e);
        } else {
            debug!("{}: merged {} ({:?})", self.id, child.id, flags);
        }
        drop(child);
        result
    }

    fn absorb(&mut self, child: &mut Filesystem, flags: CloneFlags) -> Result<()> {
        let owner = self.id;

        if flags.contains(CloneFlags::INODE) {
            if let Some(src) = child.inode_map.take() {
                absorb_bitmap(&mut self.inode_map, src, owner)?;
            }
        }

        if flags.contains(CloneFlags::BLOCK) {
            if let Some(src) = child.block_map.take() {
                absorb_bitmap(&mut self.block_map, src, owner)?;
            }
        }

        if flags.contains(CloneFlags::BADBLOCKS) {
            if let Some(src) = child.badblocks.take() {
                match &mut self.badblocks {
                    None => self.badblocks = Some(Arc::new(src.copy()?)),
                    Some(dest) => Arc::make_mut(dest).merge_from(&src)?,
                }
            }
        }

        if flags.contains(CloneFlags::DBLIST) {
            if let Some(src) = child.dblist.take() {
                match &mut self.dblist {
                    None => {
                        let mut list = Arc::try_unwrap(src).or_else(|shared| shared.copy())?;
                        list.set_owner(Some(owner));
                        self.dblist = Some(Arc::new(list));
                    }
                    Some(dest) => {
                        let dest = Arc::make_mut(dest);
                        dest.merge_from(&src)?;
                        dest.set_owner(Some(owner));
                    }
                }
            }
        }

        child.icache = None;
        Ok(())
    }
}
