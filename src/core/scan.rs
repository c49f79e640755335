//! Parallel block-group scan driver
//!
//! Splits the block groups of a filesystem into contiguous ranges, gives
//! each range a clone of the handle and a scoped thread, then merges the
//! clones back in range order.
//!
//! A bitmap shared read-only with every worker must be a bit array; the
//! interval tree's read cursor is not safe under concurrent lookups.

use crate::bitmap::Bitmap;
use crate::config::Config;
use crate::ehandler::operation_scope;
use crate::error::{Ext2Error, Result};
use crate::fs::{CloneFlags, Filesystem};
use serde::Serialize;
use std::ops::Range;
use std::thread;
use tracing::{debug, info, warn};

/// What a worker is given besides its clone
#[derive(Debug)]
pub struct ScanContext<'s> {
    pub worker: usize,
    /// Block groups this worker owns
    pub groups: Range<u32>,
    /// Bitmap shared read-only by every worker
    pub shared: Option<&'s Bitmap>,
}

/// Outcome of a scan where every worker succeeded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub workers: usize,
    pub merged: usize,
    pub ranges: Vec<Range<u32>>,
}

/// Builder and driver for one parallel scan
#[derive(Debug, Clone)]
pub struct ParallelScan<'s> {
    workers: usize,
    flags: CloneFlags,
    shared: Option<&'s Bitmap>,
}

impl Default for ParallelScan<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `[0, groups)` into at most `workers` contiguous non-empty ranges.
pub fn partition_groups(groups: u32, workers: usize) -> Vec<Range<u32>> {
    if groups == 0 {
        return Vec::new();
    }
    let workers = (workers.max(1) as u32).min(groups);
    let base = groups / workers;
    let extra = groups % workers;

    let mut ranges = Vec::with_capacity(workers as usize);
    let mut start = 0;
    for i in 0..workers {
        let len = base + u32::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

impl<'s> ParallelScan<'s> {
    pub fn new() -> Self {
        Self::from_config(&Config::default())
    }

    pub fn from_config(config: &Config) -> Self {
        ParallelScan {
            workers: config.effective_workers(),
            flags: CloneFlags::INODE | CloneFlags::BLOCK,
            shared: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Structures each worker gets a private copy of
    pub fn clone_flags(mut self, flags: CloneFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn shared_bitmap(mut self, bitmap: &'s Bitmap) -> Self {
        self.shared = Some(bitmap);
        self
    }

    /// Run `worker` once per group range and merge the results into `fs`.
    ///
    /// Children whose worker failed are dropped unmerged. Every successful
    /// child is merged before the first error is returned.
    pub fn run<F>(&self, fs: &mut Filesystem, worker: F) -> Result<ScanReport>
    where
        F: Fn(&mut Filesystem, &ScanContext<'s>) -> Result<()> + Sync,
    {
        if let Some(shared) = self.shared {
            if !shared.supports_shared_scan() {
                return Err(Ext2Error::SharedScanUnsupported);
            }
        }

        let ranges = partition_groups(fs.group_desc_count(), self.workers);
        let mut children = Vec::with_capacity(ranges.len());
        for _ in &ranges {
            children.push(fs.clone_fs(self.flags)?);
        }

        info!(
            "{}: scanning {} groups with {} workers",
            fs.id(),
            fs.group_desc_count(),
            ranges.len()
        );

        let worker = &worker;
        let shared = self.shared;
        let results: Vec<(Range<u32>, Result<Filesystem>)> = thread::scope(|s| {
            let handles: Vec<_> = children
                .into_iter()
                .zip(ranges.iter().cloned())
                .enumerate()
                .map(|(index, (mut child, groups))| {
                    s.spawn(move || {
                        let _op = operation_scope(format!(
                            "scanning groups {}..{}",
                            groups.start, groups.end
                        ));
                        let ctx = ScanContext {
                            worker: index,
                            groups: groups.clone(),
                            shared,
                        };
                        let result = worker(&mut child, &ctx).map(|()| child);
                        (groups, result)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let mut first_error = None;
        let mut merged = 0;
        for (groups, result) in results {
            let outcome = result.and_then(|child| fs.merge_fs(child));
            match outcome {
                Ok(()) => {
                    merged += 1;
                    debug!("merged worker for groups {:?}", groups);
                }
                Err(e) => {
                    warn!("worker for groups {:?} failed: {}", groups, e);
                    if first_error.is_none() {
                        first_error = Some(Ext2Error::Worker {
                            range: groups,
                            source: Box::new(e),
                        });
                    }
                }
            }
        }

        info!("{}: scan finished, {} of {} workers merged", fs.id(), merged, ranges.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(ScanReport {
                workers: ranges.len(),
                merged,
                ranges,
            }),
        }
    }
}
