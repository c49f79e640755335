//! In-memory superblock, group descriptors and filesystem geometry
//!
//! On-disk decoding lives elsewhere; these are the working copies a
//! [`Filesystem`](crate::fs::Filesystem) handle carries.

use crate::error::{Ext2Error, Result};
use serde::{Deserialize, Serialize};

pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const MIN_BLOCK_SIZE: u32 = 1024;
pub const MAX_BLOCK_SIZE: u32 = 65536;
pub const GROUP_DESC_SIZE: u32 = 32;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
pub const DEFAULT_INODE_SIZE: u16 = 256;
pub const FIRST_INO: u32 = 11;
pub const DEFAULT_INODE_RATIO: u64 = 8192;

/// `s_state`: cleanly unmounted
pub const STATE_VALID: u16 = 0x0001;
/// `s_state`: errors detected
pub const STATE_ERROR: u16 = 0x0002;

/// `s_feature_ro_compat`: superblock backups only in groups 0, 1 and powers of 3, 5, 7
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;

/// Group descriptor `bg_flags`
pub const BG_INODE_UNINIT: u16 = 0x0001;
pub const BG_BLOCK_UNINIT: u16 = 0x0002;

/// Superblock working copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u16,
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub r_blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    /// Block size is `1024 << log_block_size`
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub state: u16,
    pub mount_count: u16,
    pub feature_ro_compat: u32,
}

/// Block group descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
}

/// Parameters for creating a new filesystem
///
/// Zero means "pick the default" for `inodes_count` and `blocks_per_group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsParams {
    pub blocks_count: u64,
    pub inodes_count: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inode_size: u16,
    pub sparse_super: bool,
    pub reserved_percent: u32,
}

impl Default for FsParams {
    fn default() -> Self {
        FsParams {
            blocks_count: 0,
            inodes_count: 0,
            block_size: MIN_BLOCK_SIZE,
            blocks_per_group: 0,
            inode_size: DEFAULT_INODE_SIZE,
            sparse_super: true,
            reserved_percent: 5,
        }
    }
}

impl FsParams {
    pub fn with_blocks(blocks_count: u64) -> Self {
        FsParams {
            blocks_count,
            ..Default::default()
        }
    }
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    while n > 1 && n % base == 0 {
        n /= base;
    }
    n == 1
}

fn geometry_error(msg: impl Into<String>) -> Ext2Error {
    Ext2Error::InvalidGeometry(msg.into())
}

impl Superblock {
    /// Lay out a new filesystem.
    pub fn from_params(params: &FsParams) -> Result<Self> {
        let bs = params.block_size;
        if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
            return Err(geometry_error(format!("block size {}", bs)));
        }
        if params.inode_size < GOOD_OLD_INODE_SIZE
            || !params.inode_size.is_power_of_two()
            || u32::from(params.inode_size) > bs
        {
            return Err(geometry_error(format!("inode size {}", params.inode_size)));
        }

        let log_block_size = bs.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros();
        let first_data_block = u32::from(bs == MIN_BLOCK_SIZE);
        let max_per_group = bs * 8;

        let blocks_per_group = match params.blocks_per_group {
            0 => max_per_group,
            n if n > max_per_group || n % 8 != 0 => {
                return Err(geometry_error(format!("{} blocks per group", n)))
            }
            n => n,
        };

        let mut blocks_count = params.blocks_count;
        if blocks_count <= u64::from(first_data_block) + 1 {
            return Err(geometry_error(format!("{} blocks", blocks_count)));
        }

        let data_blocks = blocks_count - u64::from(first_data_block);
        let mut groups = data_blocks.div_ceil(u64::from(blocks_per_group));
        if groups > u64::from(u32::MAX) {
            return Err(geometry_error("too many groups"));
        }

        let target_inodes = match params.inodes_count {
            0 => blocks_count
                .checked_mul(u64::from(bs))
                .map(|bytes| (bytes / DEFAULT_INODE_RATIO).max(16))
                .ok_or_else(|| geometry_error(format!("{} blocks", blocks_count)))?,
            n => u64::from(n),
        };

        let inodes_per_block = bs / u32::from(params.inode_size);
        let align = inodes_per_block.max(8);
        let mut inodes_per_group = u32::try_from(target_inodes.div_ceil(groups))
            .map_err(|_| geometry_error("too many inodes"))?;
        inodes_per_group = inodes_per_group.div_ceil(align) * align;
        if inodes_per_group > max_per_group {
            inodes_per_group = max_per_group / align * align;
        }

        let inode_table_blocks = inodes_per_group.div_ceil(inodes_per_block);
        let desc_blocks = groups
            .checked_mul(u64::from(GROUP_DESC_SIZE))
            .map(|bytes| bytes.div_ceil(u64::from(bs)))
            .and_then(|blocks| u32::try_from(blocks).ok())
            .ok_or_else(|| geometry_error(format!("{} group descriptors", groups)))?;
        let overhead = 1 + u64::from(desc_blocks) + 2 + u64::from(inode_table_blocks);

        // Drop a trailing group too small to hold its own metadata
        let last_size = data_blocks - (groups - 1) * u64::from(blocks_per_group);
        if last_size <= overhead {
            if groups == 1 {
                return Err(geometry_error(format!(
                    "{} blocks cannot hold {} metadata blocks",
                    blocks_count, overhead
                )));
            }
            groups -= 1;
            blocks_count = u64::from(first_data_block) + groups * u64::from(blocks_per_group);
        }

        let inodes_count = u32::try_from(u64::from(inodes_per_group) * groups)
            .map_err(|_| geometry_error("too many inodes"))?;

        Ok(Superblock {
            magic: EXT2_SUPER_MAGIC,
            inodes_count,
            blocks_count,
            r_blocks_count: blocks_count * u64::from(params.reserved_percent) / 100,
            free_blocks_count: blocks_count - u64::from(first_data_block),
            free_inodes_count: inodes_count,
            first_data_block,
            log_block_size,
            blocks_per_group,
            inodes_per_group,
            first_ino: FIRST_INO,
            inode_size: params.inode_size,
            state: STATE_VALID,
            mount_count: 0,
            feature_ro_compat: if params.sparse_super {
                RO_COMPAT_SPARSE_SUPER
            } else {
                0
            },
        })
    }

    pub fn block_size(&self) -> u32 {
        MIN_BLOCK_SIZE << self.log_block_size
    }

    pub fn group_count(&self) -> u32 {
        (self.blocks_count - u64::from(self.first_data_block))
            .div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    /// Blocks needed to hold every group descriptor
    pub fn desc_blocks(&self) -> u32 {
        let bytes = u64::from(self.group_count()) * u64::from(GROUP_DESC_SIZE);
        // At most 2^37 bytes over blocks of at least 2^10
        bytes.div_ceil(u64::from(self.block_size())) as u32
    }

    pub fn inode_table_blocks(&self) -> u32 {
        let per_block = self.block_size() / u32::from(self.inode_size);
        self.inodes_per_group.div_ceil(per_block)
    }

    pub fn has_sparse_super(&self) -> bool {
        self.feature_ro_compat & RO_COMPAT_SPARSE_SUPER != 0
    }

    /// Whether `group` carries a superblock (and descriptor) copy.
    pub fn group_has_super(&self, group: u32) -> bool {
        if group <= 1 || !self.has_sparse_super() {
            return true;
        }
        is_power_of(group, 3) || is_power_of(group, 5) || is_power_of(group, 7)
    }

    pub fn group_first_block(&self, group: u32) -> u64 {
        u64::from(self.first_data_block) + u64::from(group) * u64::from(self.blocks_per_group)
    }

    pub fn group_last_block(&self, group: u32) -> u64 {
        let last = self.group_first_block(group) + u64::from(self.blocks_per_group) - 1;
        last.min(self.blocks_count - 1)
    }

    /// Group holding `blk`
    pub fn block_group(&self, blk: u64) -> u32 {
        ((blk - u64::from(self.first_data_block)) / u64::from(self.blocks_per_group)) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != EXT2_SUPER_MAGIC {
            return Err(geometry_error(format!("bad superblock magic {:#06x}", self.magic)));
        }
        if self.blocks_per_group == 0 || self.inodes_per_group == 0 {
            return Err(geometry_error("zero-sized groups"));
        }
        if self.blocks_count <= u64::from(self.first_data_block) {
            return Err(geometry_error("no data blocks"));
        }
        if u64::from(self.inodes_per_group) * u64::from(self.group_count())
            != u64::from(self.inodes_count)
        {
            return Err(geometry_error("inode count does not match groups"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_filesystem_geometry() {
        let sb = Superblock::from_params(&FsParams::with_blocks(127)).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.first_data_block, 1);
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.inodes_per_group, 16);
        assert_eq!(sb.inodes_count, 16);
        assert_eq!(sb.inode_table_blocks(), 4);
        sb.validate().unwrap();
    }

    #[test]
    fn test_multi_group_geometry() {
        let sb = Superblock::from_params(&FsParams::with_blocks(16384)).unwrap();
        assert_eq!(sb.group_count(), 2);
        assert_eq!(sb.group_first_block(1), 8193);
        assert_eq!(sb.group_last_block(1), 16383);
        assert_eq!(sb.block_group(8193), 1);
        assert_eq!(sb.inodes_count % sb.inodes_per_group, 0);
        sb.validate().unwrap();
    }

    #[test]
    fn test_tiny_last_group_is_dropped() {
        let params = FsParams {
            blocks_count: 8193 + 10,
            ..Default::default()
        };
        let sb = Superblock::from_params(&params).unwrap();
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.blocks_count, 8193);
    }

    #[test]
    fn test_sparse_super_groups() {
        let sb = Superblock::from_params(&FsParams::with_blocks(8192 * 60)).unwrap();
        let with_super: Vec<u32> = (0..sb.group_count()).filter(|&g| sb.group_has_super(g)).collect();
        assert_eq!(with_super, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }

    #[test]
    fn test_rejects_bad_params() {
        let params = FsParams {
            blocks_count: 1000,
            block_size: 3000,
            ..Default::default()
        };
        assert!(matches!(
            Superblock::from_params(&params),
            Err(Ext2Error::InvalidGeometry(_))
        ));
        assert!(Superblock::from_params(&FsParams::with_blocks(1)).is_err());
    }

    #[test]
    fn test_descriptor_table_past_u32_bytes() {
        // 2^27 groups need 2^32 bytes of descriptors
        let params = FsParams {
            blocks_count: (1 << 40) + 1,
            inodes_count: 1 << 30,
            ..Default::default()
        };
        let sb = Superblock::from_params(&params).unwrap();
        assert_eq!(sb.group_count(), 1 << 27);
        assert_eq!(sb.desc_blocks(), 1 << 22);
        sb.validate().unwrap();
    }

    #[test]
    fn test_default_inode_count_overflow_is_rejected() {
        let params = FsParams {
            blocks_count: 1 << 50,
            block_size: 65536,
            ..Default::default()
        };
        assert!(matches!(
            Superblock::from_params(&params),
            Err(Ext2Error::InvalidGeometry(_))
        ));
    }
}
