//! Filesystem handle
//!
//! A [`Filesystem`] is the in-memory aggregate for one open filesystem:
//! superblock working copy and snapshot, group descriptors, allocation
//! bitmaps, bad-block and directory-block lists, the I/O channel and an
//! inode location cache.
//!
//! Structures that clones may alias are held behind `Arc`. Mutable
//! accessors succeed only while the handle is the sole holder; a clone that
//! did not ask for a private copy of a structure sees it read-only.

mod clone;
mod dup;

pub use clone::{CloneFlags, CloneToken};
pub(crate) use clone::RefCount;

use crate::badblocks::BadBlocksList;
use crate::bitmap::{BackendType, Bitmap};
use crate::config::Config;
use crate::dblist::DirBlockList;
use crate::ehandler::{operation_scope, Ehandler, EhandlerPolicy};
use crate::error::{Ext2Error, Magic, Result};
use crate::icache::{InodeCache, InodeCacheStats, InodeLocation};
use crate::io::{ChannelStats, IoChannel};
use crate::superblock::{FsParams, GroupDesc, Superblock};
use bitflags::bitflags;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Process-unique handle identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FsId(u64);

impl FsId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FsId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs#{}", self.0)
    }
}

bitflags! {
    /// Handle state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FsFlags: u32 {
        const RW = 0x01;
        const CHANGED = 0x02;
        const DIRTY = 0x04;
        /// No inconsistency found so far
        const VALID = 0x08;
        const IB_DIRTY = 0x10;
        const BB_DIRTY = 0x20;
    }
}

/// Multiple-mount protection scratch state
#[derive(Debug)]
pub struct MmpState {
    buf: Vec<u8>,
    cmp: Vec<u8>,
    file: Option<File>,
}

impl MmpState {
    pub fn new(block_size: usize, file: Option<File>) -> Self {
        MmpState {
            buf: vec![0; block_size],
            cmp: vec![0; block_size],
            file,
        }
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Last block read back for comparison
    pub fn cmp(&self) -> &[u8] {
        &self.cmp
    }

    pub fn cmp_mut(&mut self) -> &mut [u8] {
        &mut self.cmp
    }

    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Copy the buffers and open a second descriptor on the same file.
    pub(crate) fn duplicate(&self) -> Result<MmpState> {
        let file = self
            .file
            .as_ref()
            .map(|f| f.try_clone().map_err(Ext2Error::MmpOpen))
            .transpose()?;
        Ok(MmpState {
            buf: copy_bytes(&self.buf)?,
            cmp: copy_bytes(&self.cmp)?,
            file,
        })
    }
}

fn copy_bytes(src: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(src.len())
        .map_err(|_| Ext2Error::NoMemory)?;
    out.extend_from_slice(src);
    Ok(out)
}

/// Summary report for a handle
#[derive(Debug, Clone, Serialize)]
pub struct FsStats {
    pub id: FsId,
    pub device: String,
    pub block_size: u32,
    pub blocks_count: u64,
    pub inodes_count: u32,
    pub groups: u32,
    pub flags: FsFlags,
    pub blocks_in_use: Option<u64>,
    pub inodes_in_use: Option<u64>,
    pub bitmap_backend: BackendType,
    pub valid: bool,
    pub is_clone: bool,
    pub outstanding_children: i64,
    pub io: ChannelStats,
    pub icache: Option<InodeCacheStats>,
}

/// One open filesystem
pub struct Filesystem {
    id: FsId,
    device_name: String,
    flags: FsFlags,
    block_size: u32,
    group_desc_count: u32,
    desc_blocks: u32,
    inode_blocks_per_group: u32,
    super_block: Arc<RwLock<Superblock>>,
    orig_super: Arc<Superblock>,
    group_desc: Arc<RwLock<Vec<GroupDesc>>>,
    inode_map: Option<Arc<Bitmap>>,
    block_map: Option<Arc<Bitmap>>,
    badblocks: Option<Arc<BadBlocksList>>,
    dblist: Option<Arc<DirBlockList>>,
    io: IoChannel,
    image_io: Option<IoChannel>,
    icache: Option<Arc<InodeCache>>,
    icache_size: usize,
    mmp: Option<Arc<MmpState>>,
    priv_data: Option<Arc<dyn Any + Send + Sync>>,
    default_bitmap_type: BackendType,
    clone_flags: CloneFlags,
    /// Present on clones; releasing it decrements the parent's child count
    parent: Option<CloneToken>,
    children: Arc<RefCount>,
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("id", &self.id)
            .field("device_name", &self.device_name)
            .field("flags", &self.flags)
            .field("block_size", &self.block_size)
            .field("group_desc_count", &self.group_desc_count)
            .field("clone_flags", &self.clone_flags)
            .field("parent", &self.parent_id())
            .field("children", &self.outstanding_children())
            .finish_non_exhaustive()
    }
}

/// `(start, end, real_end)` of the block bitmap
fn block_domain(sb: &Superblock) -> (u64, u64, u64) {
    let start = u64::from(sb.first_data_block);
    let end = sb.blocks_count - 1;
    let real_end = start + u64::from(sb.blocks_per_group) * u64::from(sb.group_count()) - 1;
    (start, end, real_end)
}

/// `(start, end, real_end)` of the inode bitmap
fn inode_domain(sb: &Superblock) -> (u64, u64, u64) {
    let end = u64::from(sb.inodes_count);
    let real_end = u64::from(sb.inodes_per_group) * u64::from(sb.group_count());
    (1, end, real_end)
}

fn new_block_bitmap(sb: &Superblock, backend: BackendType, descr: &str) -> Result<Bitmap> {
    let (start, end, real_end) = block_domain(sb);
    Bitmap::new(Magic::BlockBitmap, backend, start, end, real_end, descr)
}

fn new_inode_bitmap(sb: &Superblock, backend: BackendType, descr: &str) -> Result<Bitmap> {
    let (start, end, real_end) = inode_domain(sb);
    Bitmap::new(Magic::InodeBitmap, backend, start, end, real_end, descr)
}

fn check_domain(map: &Bitmap, expected: (u64, u64, u64)) -> Result<()> {
    if (map.start(), map.end(), map.real_end()) == expected {
        Ok(())
    } else {
        Err(Ext2Error::InvalidDomain {
            start: map.start(),
            end: map.end(),
            real_end: map.real_end(),
        })
    }
}

/// Place each group's superblock copy, descriptor table, bitmaps and inode
/// table, marking them in use.
fn allocate_tables(
    sb: &mut Superblock,
    block_map: &mut Bitmap,
    inode_map: &mut Bitmap,
) -> Result<Vec<GroupDesc>> {
    let groups = sb.group_count();
    let desc_blocks = u64::from(sb.desc_blocks());
    let table_blocks = u64::from(sb.inode_table_blocks());
    let reserved_inodes = sb.first_ino - 1;
    if reserved_inodes > sb.inodes_per_group {
        return Err(Ext2Error::InvalidGeometry(format!(
            "{} inodes per group cannot hold {} reserved inodes",
            sb.inodes_per_group, reserved_inodes
        )));
    }

    let mut descs = Vec::new();
    descs
        .try_reserve_exact(groups as usize)
        .map_err(|_| Ext2Error::NoMemory)?;

    let mut free_blocks = 0u64;
    for group in 0..groups {
        let first = sb.group_first_block(group);
        let last = sb.group_last_block(group);
        let mut next = first;

        if sb.group_has_super(group) {
            block_map.mark_range(next, 1 + desc_blocks)?;
            next += 1 + desc_blocks;
        }

        let needed = 2 + table_blocks;
        if next + needed - 1 > last {
            return Err(Ext2Error::InvalidGeometry(format!(
                "group {} too small for its metadata",
                group
            )));
        }
        block_map.mark_range(next, needed)?;

        let mut gd = GroupDesc {
            block_bitmap: next,
            inode_bitmap: next + 1,
            inode_table: next + 2,
            ..Default::default()
        };
        next += needed;

        let free = last + 1 - next;
        gd.free_blocks_count = free as u32;
        gd.free_inodes_count = sb.inodes_per_group;
        if group == 0 {
            inode_map.mark_range(1, u64::from(reserved_inodes))?;
            gd.free_inodes_count -= reserved_inodes;
        }

        free_blocks += free;
        descs.push(gd);
    }

    sb.free_blocks_count = free_blocks;
    sb.free_inodes_count = sb.inodes_count - reserved_inodes;
    Ok(descs)
}

/// Set every bit from `from` to the end of `buf`.
fn pad_bitmap_block(buf: &mut [u8], from: usize) {
    let total = buf.len() * 8;
    let mut bit = from;
    while bit < total && bit % 8 != 0 {
        buf[bit / 8] |= 1 << (bit % 8);
        bit += 1;
    }
    if bit < total {
        buf[bit / 8..].fill(0xff);
    }
}

impl Filesystem {
    /// Lay out a new filesystem on `io` with the default configuration.
    pub fn initialize(name: &str, params: &FsParams, io: IoChannel) -> Result<Self> {
        Self::initialize_with(name, params, io, &Config::default())
    }

    /// Lay out a new filesystem on `io`.
    ///
    /// Only in-memory state is built; nothing reaches the device until
    /// [`write_bitmaps`](Self::write_bitmaps) or [`close`](Self::close).
    pub fn initialize_with(
        name: &str,
        params: &FsParams,
        io: IoChannel,
        config: &Config,
    ) -> Result<Self> {
        let mut sb = Superblock::from_params(params)?;
        sb.validate()?;
        io.set_block_size(sb.block_size())?;
        io.set_flags(io.flags() | config.channel.flags());

        let backend = config.bitmap_backend;
        let mut block_map = new_block_bitmap(&sb, backend, "block bitmap")?;
        let mut inode_map = new_inode_bitmap(&sb, backend, "inode bitmap")?;
        let descs = allocate_tables(&mut sb, &mut block_map, &mut inode_map)?;

        let id = FsId::next();
        block_map.set_owner(Some(id));
        inode_map.set_owner(Some(id));

        info!(
            "initialized {} ({}): {} blocks, {} inodes, {} groups",
            name,
            id,
            sb.blocks_count,
            sb.inodes_count,
            descs.len()
        );

        let fs = Filesystem {
            id,
            device_name: name.to_string(),
            flags: FsFlags::RW
                | FsFlags::VALID
                | FsFlags::DIRTY
                | FsFlags::BB_DIRTY
                | FsFlags::IB_DIRTY,
            block_size: sb.block_size(),
            group_desc_count: sb.group_count(),
            desc_blocks: sb.desc_blocks(),
            inode_blocks_per_group: sb.inode_table_blocks(),
            orig_super: Arc::new(sb.clone()),
            super_block: Arc::new(RwLock::new(sb)),
            group_desc: Arc::new(RwLock::new(descs)),
            inode_map: Some(Arc::new(inode_map)),
            block_map: Some(Arc::new(block_map)),
            badblocks: None,
            dblist: None,
            io,
            image_io: None,
            icache: None,
            icache_size: config.icache_size,
            mmp: None,
            priv_data: None,
            default_bitmap_type: backend,
            clone_flags: CloneFlags::empty(),
            parent: None,
            children: Arc::new(RefCount::new()),
        };
        if config.ehandler.install {
            fs.install_error_handler(&config.ehandler);
        }
        Ok(fs)
    }

    pub fn id(&self) -> FsId {
        self.id
    }

    pub fn magic(&self) -> Magic {
        Magic::Filesystem
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn flags(&self) -> FsFlags {
        self.flags
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(FsFlags::VALID)
    }

    pub fn mark_valid(&mut self) {
        self.flags.insert(FsFlags::VALID);
    }

    pub fn unmark_valid(&mut self) {
        self.flags.remove(FsFlags::VALID);
    }

    pub fn mark_dirty(&mut self) {
        self.flags.insert(FsFlags::DIRTY | FsFlags::CHANGED);
    }

    pub fn mark_bb_dirty(&mut self) {
        self.flags.insert(FsFlags::BB_DIRTY | FsFlags::CHANGED);
    }

    pub fn mark_ib_dirty(&mut self) {
        self.flags.insert(FsFlags::IB_DIRTY | FsFlags::CHANGED);
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn group_desc_count(&self) -> u32 {
        self.group_desc_count
    }

    pub fn desc_blocks(&self) -> u32 {
        self.desc_blocks
    }

    pub fn inode_blocks_per_group(&self) -> u32 {
        self.inode_blocks_per_group
    }

    /// Superblock working copy, shared with clones
    pub fn super_block(&self) -> RwLockReadGuard<'_, Superblock> {
        self.super_block.read()
    }

    pub fn super_block_mut(&self) -> RwLockWriteGuard<'_, Superblock> {
        self.super_block.write()
    }

    /// Superblock as it was when the handle was opened
    pub fn orig_super(&self) -> &Superblock {
        &self.orig_super
    }

    pub fn group_desc(&self, group: u32) -> Result<GroupDesc> {
        self.group_desc
            .read()
            .get(group as usize)
            .copied()
            .ok_or(Ext2Error::BadGroupNum(group))
    }

    pub fn set_group_desc(&self, group: u32, desc: GroupDesc) -> Result<()> {
        let mut descs = self.group_desc.write();
        let slot = descs
            .get_mut(group as usize)
            .ok_or(Ext2Error::BadGroupNum(group))?;
        *slot = desc;
        Ok(())
    }

    pub fn inode_map(&self) -> Option<&Bitmap> {
        self.inode_map.as_deref()
    }

    pub fn block_map(&self) -> Option<&Bitmap> {
        self.block_map.as_deref()
    }

    pub fn badblocks(&self) -> Option<&BadBlocksList> {
        self.badblocks.as_deref()
    }

    pub fn dblist(&self) -> Option<&DirBlockList> {
        self.dblist.as_deref()
    }

    pub fn inode_map_mut(&mut self) -> Result<&mut Bitmap> {
        exclusive(&mut self.inode_map, "inode bitmap")
    }

    pub fn block_map_mut(&mut self) -> Result<&mut Bitmap> {
        exclusive(&mut self.block_map, "block bitmap")
    }

    pub fn badblocks_mut(&mut self) -> Result<&mut BadBlocksList> {
        exclusive(&mut self.badblocks, "bad blocks list")
    }

    pub fn dblist_mut(&mut self) -> Result<&mut DirBlockList> {
        exclusive(&mut self.dblist, "directory block list")
    }

    /// Install an inode bitmap with exactly this filesystem's inode domain.
    pub fn set_inode_map(&mut self, mut map: Bitmap) -> Result<()> {
        Ext2Error::check_magic(Magic::InodeBitmap, map.magic())?;
        check_domain(&map, inode_domain(&self.super_block()))?;
        map.set_owner(Some(self.id));
        self.inode_map = Some(Arc::new(map));
        Ok(())
    }

    /// Install a block bitmap with exactly this filesystem's block domain.
    pub fn set_block_map(&mut self, mut map: Bitmap) -> Result<()> {
        Ext2Error::check_magic(Magic::BlockBitmap, map.magic())?;
        check_domain(&map, block_domain(&self.super_block()))?;
        map.set_owner(Some(self.id));
        self.block_map = Some(Arc::new(map));
        Ok(())
    }

    pub fn set_badblocks(&mut self, list: Option<BadBlocksList>) {
        self.badblocks = list.map(Arc::new);
    }

    /// Start an empty directory block list.
    pub fn init_dblist(&mut self) {
        let mut list = DirBlockList::new();
        list.set_owner(Some(self.id));
        self.dblist = Some(Arc::new(list));
    }

    pub fn set_dblist(&mut self, list: Option<DirBlockList>) {
        self.dblist = list.map(|mut l| {
            l.set_owner(Some(self.id));
            Arc::new(l)
        });
    }

    pub fn default_bitmap_type(&self) -> BackendType {
        self.default_bitmap_type
    }

    pub fn set_default_bitmap_type(&mut self, backend: BackendType) {
        self.default_bitmap_type = backend;
    }

    /// New all-clear bitmap over this filesystem's blocks.
    pub fn allocate_block_bitmap(&self, descr: &str) -> Result<Bitmap> {
        let mut map = new_block_bitmap(&self.super_block(), self.default_bitmap_type, descr)?;
        map.set_owner(Some(self.id));
        Ok(map)
    }

    /// New all-clear bitmap over this filesystem's inodes.
    pub fn allocate_inode_bitmap(&self, descr: &str) -> Result<Bitmap> {
        let mut map = new_inode_bitmap(&self.super_block(), self.default_bitmap_type, descr)?;
        map.set_owner(Some(self.id));
        Ok(map)
    }

    pub fn io(&self) -> &IoChannel {
        &self.io
    }

    pub fn image_io(&self) -> Option<&IoChannel> {
        self.image_io.as_ref()
    }

    pub fn set_image_io(&mut self, io: Option<IoChannel>) {
        self.image_io = io;
    }

    /// Install the reference bad-block handler on this handle's channel.
    pub fn install_error_handler(&self, policy: &EhandlerPolicy) -> Arc<Ehandler> {
        let blocks = self.super_block().blocks_count;
        Ehandler::with_policy(blocks, policy).install(&self.io)
    }

    pub fn icache(&self) -> Option<&Arc<InodeCache>> {
        self.icache.as_ref()
    }

    pub fn mmp(&self) -> Option<&MmpState> {
        self.mmp.as_deref()
    }

    pub fn mmp_mut(&mut self) -> Result<&mut MmpState> {
        exclusive(&mut self.mmp, "MMP buffers")
    }

    /// Allocate MMP scratch buffers, optionally with an open MMP file.
    pub fn enable_mmp(&mut self, file: Option<File>) {
        self.mmp = Some(Arc::new(MmpState::new(self.block_size as usize, file)));
    }

    /// Attach application data, shared with clones and duplicates.
    pub fn set_priv_data<T: Any + Send + Sync>(&mut self, data: T) {
        self.priv_data = Some(Arc::new(data));
    }

    pub fn priv_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.priv_data.as_deref()?.downcast_ref::<T>()
    }

    pub fn clone_flags(&self) -> CloneFlags {
        self.clone_flags
    }

    pub fn is_clone(&self) -> bool {
        self.parent.is_some()
    }

    /// Handle this clone descends from
    pub fn parent_id(&self) -> Option<FsId> {
        self.parent.as_ref().map(CloneToken::parent)
    }

    /// Clones of this handle not yet merged or dropped
    pub fn outstanding_children(&self) -> i64 {
        self.children.get()
    }

    /// On-disk location of inode `ino`, through the inode cache.
    pub fn inode_location(&mut self, ino: u32) -> Result<InodeLocation> {
        let (inodes_count, per_group, inode_size) = {
            let sb = self.super_block.read();
            (sb.inodes_count, sb.inodes_per_group, sb.inode_size)
        };
        if ino == 0 || ino > inodes_count {
            return Err(Ext2Error::BadInodeNum(u64::from(ino)));
        }

        let size = self.icache_size;
        let cache = self
            .icache
            .get_or_insert_with(|| Arc::new(InodeCache::new(size)));
        if let Some(loc) = cache.get(ino) {
            return Ok(loc);
        }

        let group = (ino - 1) / per_group;
        let index = (ino - 1) % per_group;
        let table = self
            .group_desc
            .read()
            .get(group as usize)
            .map(|gd| gd.inode_table)
            .ok_or(Ext2Error::BadGroupNum(group))?;

        let byte = u64::from(index) * u64::from(inode_size);
        let bs = u64::from(self.block_size);
        let loc = InodeLocation {
            group,
            block: table + byte / bs,
            offset: (byte % bs) as u32,
        };
        cache.insert(ino, loc);
        Ok(loc)
    }

    /// Load both bitmaps from their on-disk blocks, replacing any in memory.
    pub fn read_bitmaps(&mut self) -> Result<()> {
        let _op = operation_scope("reading bitmaps");
        let sb = self.super_block.read().clone();
        let descs = self.group_desc.read().clone();
        let bs = self.block_size as usize;

        let mut block_map = self.allocate_block_bitmap("block bitmap")?;
        let mut inode_map = self.allocate_inode_bitmap("inode bitmap")?;
        let mut buf = vec![0u8; bs];

        for (group, gd) in (0..sb.group_count()).zip(&descs) {
            let first = sb.group_first_block(group);
            let count = sb.group_last_block(group) - first + 1;
            self.io.read_blk(gd.block_bitmap, 1, &mut buf)?;
            block_map.set_range(first, count, &buf)?;

            let ino_first = u64::from(group) * u64::from(sb.inodes_per_group) + 1;
            self.io.read_blk(gd.inode_bitmap, 1, &mut buf)?;
            inode_map.set_range(ino_first, u64::from(sb.inodes_per_group), &buf)?;
        }

        debug!(
            "{}: read bitmaps for {} groups ({} blocks, {} inodes in use)",
            self.id,
            descs.len(),
            block_map.count_set(),
            inode_map.count_set()
        );

        self.block_map = Some(Arc::new(block_map));
        self.inode_map = Some(Arc::new(inode_map));
        self.flags.remove(FsFlags::BB_DIRTY | FsFlags::IB_DIRTY);
        Ok(())
    }

    /// Write dirty bitmaps, one block per group.
    ///
    /// Bits past the end of the filesystem and past the group size are
    /// written as in use.
    pub fn write_bitmaps(&mut self) -> Result<()> {
        let _op = operation_scope("writing bitmaps");
        let sb = self.super_block.read().clone();
        let descs = self.group_desc.read().clone();
        let bs = self.block_size as usize;
        let mut buf = vec![0u8; bs];

        if let (true, Some(map)) = (self.flags.contains(FsFlags::BB_DIRTY), &self.block_map) {
            for (group, gd) in (0..sb.group_count()).zip(&descs) {
                let first = sb.group_first_block(group);
                let count = sb.group_last_block(group) - first + 1;
                buf.fill(0);
                map.get_range(first, count, &mut buf)?;
                pad_bitmap_block(&mut buf, count as usize);
                self.io.write_blk(gd.block_bitmap, 1, &buf)?;
            }
            self.flags.remove(FsFlags::BB_DIRTY);
        }

        if let (true, Some(map)) = (self.flags.contains(FsFlags::IB_DIRTY), &self.inode_map) {
            let per_group = u64::from(sb.inodes_per_group);
            for (group, gd) in (0..sb.group_count()).zip(&descs) {
                let first = u64::from(group) * per_group + 1;
                buf.fill(0);
                map.get_range(first, per_group, &mut buf)?;
                pad_bitmap_block(&mut buf, per_group as usize);
                self.io.write_blk(gd.inode_bitmap, 1, &buf)?;
            }
            self.flags.remove(FsFlags::IB_DIRTY);
        }

        Ok(())
    }

    pub fn stats(&self) -> FsStats {
        let sb = self.super_block.read();
        FsStats {
            id: self.id,
            device: self.device_name.clone(),
            block_size: self.block_size,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            groups: self.group_desc_count,
            flags: self.flags,
            blocks_in_use: self.block_map.as_ref().map(|m| m.count_set()),
            inodes_in_use: self.inode_map.as_ref().map(|m| m.count_set()),
            bitmap_backend: self.default_bitmap_type,
            valid: self.is_valid(),
            is_clone: self.is_clone(),
            outstanding_children: self.outstanding_children(),
            io: self.io.stats(),
            icache: self.icache.as_ref().map(|c| c.stats()),
        }
    }

    pub fn stats_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.stats())?)
    }

    /// Flush and release the handle.
    ///
    /// A writable root handle writes its dirty bitmaps first. Fails while
    /// clones are outstanding.
    pub fn close(mut self) -> Result<()> {
        let outstanding = self.outstanding_children();
        if outstanding > 0 {
            return Err(Ext2Error::ChildrenOutstanding(outstanding));
        }
        if self.flags.contains(FsFlags::RW) && !self.is_clone() {
            self.write_bitmaps()?;
        }
        self.io.flush()?;
        debug!("{}: closed {}", self.id, self.device_name);
        Ok(())
    }
}

/// Mutable access to a structure this handle holds alone.
fn exclusive<'a, T>(slot: &'a mut Option<Arc<T>>, name: &'static str) -> Result<&'a mut T> {
    let arc = slot.as_mut().ok_or(Ext2Error::NotLoaded(name))?;
    Arc::get_mut(arc).ok_or(Ext2Error::SharedStructure(name))
}
