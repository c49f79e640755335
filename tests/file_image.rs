//! Bitmaps written to an image file survive a reopen

use anyhow::Result;
use ext2fs_rs::{CloneFlags, FileDevice, Filesystem, FsParams, IoChannel};
use tempfile::TempDir;

#[test]
fn test_bitmaps_persist_through_image_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("disk.img");
    let params = FsParams::with_blocks(20000);

    let device = FileDevice::create(&path, 20000 * 1024)?;
    let mut fs = Filesystem::initialize("disk.img", &params, IoChannel::new("disk.img", device, 1024))?;

    let mut child = fs.clone_fs(CloneFlags::BLOCK | CloneFlags::INODE)?;
    child.block_map_mut()?.mark_range(15000, 300)?;
    child.inode_map_mut()?.mark(1500)?;
    fs.merge_fs(child)?;
    fs.mark_bb_dirty();
    fs.mark_ib_dirty();

    let blocks = fs.block_map().unwrap().copy()?;
    let inodes = fs.inode_map().unwrap().copy()?;
    fs.close()?;

    let device = FileDevice::open(&path)?;
    assert_eq!(device.path(), path.as_path());
    let mut reopened =
        Filesystem::initialize("disk.img", &params, IoChannel::new("disk.img", device, 1024))?;
    reopened.read_bitmaps()?;

    reopened.block_map().unwrap().compare(&blocks)?.into_result()?;
    reopened.inode_map().unwrap().compare(&inodes)?.into_result()?;
    assert!(reopened.inode_map().unwrap().test(1500)?);
    Ok(())
}
