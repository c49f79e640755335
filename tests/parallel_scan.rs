//! Parallel group scans over a multi-group filesystem

use ext2fs_rs::{
    BackendType, Bitmap, CloneFlags, Config, Ext2Error, Filesystem, FsParams, IoChannel,
    MemDevice, ParallelScan,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 32768 data blocks in four groups of 8192
fn filesystem() -> Filesystem {
    let io = IoChannel::new("scan.img", MemDevice::new(0), 1024);
    let fs = Filesystem::initialize("scan.img", &FsParams::with_blocks(32769), io).unwrap();
    assert_eq!(fs.group_desc_count(), 4);
    fs
}

#[test]
fn test_scan_merges_every_worker() {
    let mut fs = filesystem();
    let in_use = fs.block_map().unwrap().count_set();

    let report = ParallelScan::new()
        .workers(4)
        .run(&mut fs, |child, ctx| {
            let sb = child.super_block().clone();
            for group in ctx.groups.clone() {
                // Last block of each group is never metadata
                child.block_map_mut()?.mark(sb.group_last_block(group))?;
                child.inode_map_mut()?.mark(u64::from(group) * u64::from(sb.inodes_per_group) + 20)?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(report.workers, 4);
    assert_eq!(report.merged, 4);
    assert_eq!(report.ranges, vec![0..1, 1..2, 2..3, 3..4]);
    assert_eq!(fs.outstanding_children(), 0);

    let sb = fs.super_block().clone();
    for group in 0..4 {
        assert!(fs.block_map().unwrap().test(sb.group_last_block(group)).unwrap());
    }
    assert_eq!(fs.block_map().unwrap().count_set(), in_use + 4);
}

#[test]
fn test_workers_run_under_operation_label() {
    let mut fs = filesystem();
    let seen = AtomicUsize::new(0);

    ParallelScan::new()
        .workers(2)
        .clone_flags(CloneFlags::BLOCK)
        .run(&mut fs, |_, ctx| {
            let label = ext2fs_rs::current_operation();
            assert_eq!(
                label,
                Some(format!("scanning groups {}..{}", ctx.groups.start, ctx.groups.end))
            );
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failed_worker_is_reported_with_its_range() {
    let mut fs = filesystem();

    let err = ParallelScan::new()
        .workers(4)
        .run(&mut fs, |child, ctx| {
            if ctx.groups.contains(&2) {
                return Err(Ext2Error::BadGroupNum(2));
            }
            let last = child.super_block().group_last_block(ctx.groups.start);
            child.block_map_mut()?.mark(last)?;
            Ok(())
        })
        .unwrap_err();

    match err {
        Ext2Error::Worker { range, source } => {
            assert_eq!(range, 2..3);
            assert!(matches!(*source, Ext2Error::BadGroupNum(2)));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Successful workers were still merged; the failed clone was dropped
    let sb = fs.super_block().clone();
    let map = fs.block_map().unwrap();
    assert!(map.test(sb.group_last_block(0)).unwrap());
    assert!(map.test(sb.group_last_block(3)).unwrap());
    assert!(!map.test(sb.group_last_block(2)).unwrap());
    assert_eq!(fs.outstanding_children(), 0);
}

#[test]
fn test_shared_bitmap_must_be_bit_array() {
    let mut fs = filesystem();

    let tree = Bitmap::generic(BackendType::RbTree, 0, 1023, "seen").unwrap();
    let err = ParallelScan::new()
        .shared_bitmap(&tree)
        .run(&mut fs, |_, _| Ok(()))
        .unwrap_err();
    assert!(matches!(err, Ext2Error::SharedScanUnsupported));
    assert_eq!(fs.outstanding_children(), 0);

    let mut flat = Bitmap::generic(BackendType::BitArray, 0, 1023, "seen").unwrap();
    flat.mark_range(100, 10).unwrap();
    let report = ParallelScan::new()
        .workers(3)
        .shared_bitmap(&flat)
        .run(&mut fs, |_, ctx| {
            let shared = ctx.shared.expect("shared bitmap");
            assert!(shared.test(105).unwrap());
            assert!(!shared.test(200).unwrap());
            Ok(())
        })
        .unwrap();
    assert_eq!(report.ranges, vec![0..2, 2..3, 3..4]);
}

#[test]
fn test_scan_from_config() {
    let config = Config::builder()
        .scan_workers(2)
        .bitmap_backend(BackendType::BitArray)
        .build();
    let io = IoChannel::new("scan.img", MemDevice::new(0), 1024);
    let mut fs =
        Filesystem::initialize_with("scan.img", &FsParams::with_blocks(32769), io, &config)
            .unwrap();
    assert_eq!(fs.block_map().unwrap().backend_type(), BackendType::BitArray);

    let report = ParallelScan::from_config(&config)
        .run(&mut fs, |_, _| Ok(()))
        .unwrap();
    assert_eq!(report.workers, 2);
    assert_eq!(report.ranges, vec![0..2, 2..4]);
}
