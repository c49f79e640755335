//! # ext2fs-rs - allocation bitmaps and handle clone/merge for ext2/3/4
//!
//! `ext2fs-rs` holds the metadata-consistency core of an ext-family
//! filesystem toolkit:
//!
//! - **Bitmaps** over block and inode numbers, with a flat bit-array
//!   backend and an interval-tree backend behind one API
//! - **Filesystem handles** carrying superblock, group descriptors,
//!   bitmaps, bad-block and directory-block lists
//! - **Duplication** of a handle into an independent deep copy
//! - **Clone/merge** so worker threads can scan disjoint block groups on
//!   private copies and fold their findings back into one parent
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ext2fs_rs::{CloneFlags, Filesystem, FsParams, IoChannel, MemDevice, Result};
//!
//! # fn main() -> Result<()> {
//! let io = IoChannel::new("disk.img", MemDevice::new(16 << 20), 1024);
//! let mut fs = Filesystem::initialize("disk.img", &FsParams::with_blocks(16384), io)?;
//!
//! let mut child = fs.clone_fs(CloneFlags::BLOCK)?;
//! child.block_map_mut()?.mark(9000)?;
//!
//! fs.merge_fs(child)?;
//! assert!(fs.block_map().unwrap().test(9000)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Parallel scans
//!
//! ```rust,no_run
//! use ext2fs_rs::{Filesystem, ParallelScan, Result};
//!
//! # fn scan(fs: &mut Filesystem) -> Result<()> {
//! ParallelScan::new().workers(4).run(fs, |child, ctx| {
//!     let sb = child.super_block().clone();
//!     for group in ctx.groups.clone() {
//!         let first = sb.group_first_block(group);
//!         child.block_map_mut()?.mark(first)?;
//!     }
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

// Core implementation
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{
    badblocks, bitmap, config, dblist, ehandler, error, fs, icache, io, scan, superblock,
};

pub use crate::core::{
    badblocks::BadBlocksList,
    bitmap::{BackendType, Bitmap, Comparison},
    config::{Config, ConfigBuilder},
    dblist::{DirBlock, DirBlockList},
    ehandler::{current_operation, operation_scope, AutoPrompter, Ehandler, EhandlerPolicy, Prompter},
    error::{Ext2Error, Magic, MismatchKind, Result},
    fs::{CloneFlags, Filesystem, FsFlags, FsId, FsStats},
    icache::{InodeCache, InodeLocation},
    io::{BlockDevice, ChannelFlags, FileDevice, IoChannel, IoErrorContext, IoErrorHandler, MemDevice},
    scan::{ParallelScan, ScanContext, ScanReport},
    superblock::{FsParams, GroupDesc, Superblock},
};
