//! Deep copy of a filesystem handle

use super::{CloneFlags, FsId, Filesystem, RefCount};
use crate::error::{Ext2Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

fn copy_opt<T>(src: &Option<Arc<T>>, copy: impl FnOnce(&T) -> Result<T>) -> Result<Option<Arc<T>>> {
    src.as_deref().map(copy).transpose().map(|v| v.map(Arc::new))
}

impl Filesystem {
    /// Independent copy of this handle.
    ///
    /// Superblock, descriptors, bitmaps, lists and MMP state are copied;
    /// the I/O channels and inode cache are shared. The copy is a root
    /// handle with no clones of its own.
    pub fn duplicate(&self) -> Result<Filesystem> {
        let id = FsId::next();

        let super_block = self.super_block.read().clone();
        let orig_super = (*self.orig_super).clone();

        let group_desc = {
            let src = self.group_desc.read();
            let mut descs = Vec::new();
            descs
                .try_reserve_exact(src.len())
                .map_err(|_| Ext2Error::NoMemory)?;
            descs.extend_from_slice(&src);
            descs
        };

        let mut inode_map = copy_opt(&self.inode_map, |m| m.copy())?;
        let mut block_map = copy_opt(&self.block_map, |m| m.copy())?;
        let badblocks = copy_opt(&self.badblocks, |l| l.copy())?;
        let mut dblist = copy_opt(&self.dblist, |l| l.copy())?;
        let mmp = copy_opt(&self.mmp, |m| m.duplicate())?;

        for map in [&mut inode_map, &mut block_map] {
            if let Some(map) = map.as_mut().and_then(Arc::get_mut) {
                map.set_owner(Some(id));
            }
        }
        if let Some(list) = dblist.as_mut().and_then(Arc::get_mut) {
            list.set_owner(Some(id));
        }

        debug!("{}: duplicated as {}", self.id, id);

        Ok(Filesystem {
            id,
            device_name: self.device_name.clone(),
            flags: self.flags,
            block_size: self.block_size,
            group_desc_count: self.group_desc_count,
            desc_blocks: self.desc_blocks,
            inode_blocks_per_group: self.inode_blocks_per_group,
            super_block: Arc::new(RwLock::new(super_block)),
            orig_super: Arc::new(orig_super),
            group_desc: Arc::new(RwLock::new(group_desc)),
            inode_map,
            block_map,
            badblocks,
            dblist,
            io: self.io.clone(),
            image_io: self.image_io.clone(),
            icache: self.icache.clone(),
            icache_size: self.icache_size,
            mmp,
            priv_data: self.priv_data.clone(),
            default_bitmap_type: self.default_bitmap_type,
            clone_flags: CloneFlags::empty(),
            parent: None,
            children: Arc::new(RefCount::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::badblocks::BadBlocksList;
    use crate::fs::Filesystem;
    use crate::io::{IoChannel, MemDevice};
    use crate::superblock::FsParams;
    use std::io::Write;

    fn fs() -> Filesystem {
        let io = IoChannel::new("mem", MemDevice::new(0), 1024);
        Filesystem::initialize("dup.img", &FsParams::with_blocks(4096), io).unwrap()
    }

    #[test]
    fn test_duplicate_is_deep() {
        let mut src = fs();
        src.set_badblocks(Some([77, 78].into_iter().collect::<BadBlocksList>()));
        src.init_dblist();
        src.dblist_mut().unwrap().add(2, 300, 0).unwrap();

        let mut dup = src.duplicate().unwrap();
        assert_ne!(dup.id(), src.id());
        assert!(!dup.is_clone());
        assert_eq!(src.io().refcount(), 2);

        assert!(dup.block_map().unwrap().compare(src.block_map().unwrap()).unwrap().is_equal());
        assert!(dup.inode_map().unwrap().compare(src.inode_map().unwrap()).unwrap().is_equal());
        assert_eq!(dup.badblocks(), src.badblocks());
        assert!(dup.dblist().unwrap().same_entries(src.dblist().unwrap()));
        assert_eq!(dup.block_map().unwrap().owner(), Some(dup.id()));

        dup.block_map_mut().unwrap().mark(4000).unwrap();
        assert!(!src.block_map().unwrap().test(4000).unwrap());

        dup.super_block_mut().mount_count = 9;
        assert_eq!(src.super_block().mount_count, 0);

        dup.set_group_desc(0, Default::default()).unwrap();
        assert_ne!(src.group_desc(0).unwrap(), dup.group_desc(0).unwrap());
    }

    #[test]
    fn test_duplicate_shares_icache() {
        let mut src = fs();
        src.inode_location(12).unwrap();

        let dup = src.duplicate().unwrap();
        assert_eq!(dup.icache().unwrap().len(), 1);

        src.icache().unwrap().flush();
        assert!(dup.icache().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_reopens_mmp_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"mmp").unwrap();

        let mut src = fs();
        src.enable_mmp(Some(file));
        src.mmp_mut().unwrap().buf_mut()[0] = 0x4d;

        let mut dup = src.duplicate().unwrap();
        assert!(dup.mmp().unwrap().file().is_some());
        assert_eq!(dup.mmp().unwrap().buf()[0], 0x4d);

        dup.mmp_mut().unwrap().buf_mut()[0] = 0;
        assert_eq!(src.mmp().unwrap().buf()[0], 0x4d);
    }
}
