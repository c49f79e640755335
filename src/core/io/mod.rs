//! Block I/O channel
//!
//! An [`IoChannel`] wraps one [`BlockDevice`] and is shared by reference
//! count between a filesystem handle, its duplicates and its clones.
//! Failed transfers are routed to an installed [`IoErrorHandler`] before
//! they reach the caller.

pub mod device;

use crate::ehandler::current_operation;
use crate::error::{Ext2Error, Magic, Result};
use bitflags::bitflags;
use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use device::{FileDevice, MemDevice};

/// Byte-addressed storage under a channel
pub trait BlockDevice: Send {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`, returning how many were written.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// Size in bytes
    fn size(&self) -> u64;
}

bitflags! {
    /// Channel behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ChannelFlags: u32 {
        /// Channel is used from several threads
        const THREADS = 0x1;
        /// Bypass any caching layer
        const NOCACHE = 0x2;
    }
}

/// Where a failed transfer happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoErrorContext {
    pub block: u64,
    pub count: usize,
    /// Label of the operation the calling thread was performing
    pub operation: Option<String>,
}

/// Callbacks consulted when a transfer fails
///
/// `Ok(())` means the failure was handled and the transfer counts as
/// successful; `Err` is passed up to the caller.
pub trait IoErrorHandler: Send + Sync {
    fn on_read_error(
        &self,
        channel: &IoChannel,
        ctx: &IoErrorContext,
        buf: &mut [u8],
        error: io::Error,
    ) -> Result<()>;

    fn on_write_error(
        &self,
        channel: &IoChannel,
        ctx: &IoErrorContext,
        buf: &[u8],
        error: io::Error,
    ) -> Result<()>;
}

/// Transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

struct ChannelInner {
    name: String,
    device: Mutex<Box<dyn BlockDevice>>,
    block_size: AtomicCell<u32>,
    flags: AtomicCell<ChannelFlags>,
    handler: RwLock<Option<Arc<dyn IoErrorHandler>>>,
    counters: Counters,
}

enum Failure {
    Short(usize),
    Device(io::Error),
}

impl Failure {
    fn into_io(self, wanted: usize) -> io::Error {
        match self {
            Failure::Short(got) => io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short transfer: {} of {} bytes", got, wanted),
            ),
            Failure::Device(e) => e,
        }
    }
}

/// Shared, reference-counted block channel
#[derive(Clone)]
pub struct IoChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChannel")
            .field("name", &self.inner.name)
            .field("block_size", &self.block_size())
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl IoChannel {
    pub fn new(name: impl Into<String>, device: impl BlockDevice + 'static, block_size: u32) -> Self {
        IoChannel {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                device: Mutex::new(Box::new(device)),
                block_size: AtomicCell::new(block_size.max(1)),
                flags: AtomicCell::new(ChannelFlags::empty()),
                handler: RwLock::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn magic(&self) -> Magic {
        Magic::IoChannel
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn block_size(&self) -> u32 {
        self.inner.block_size.load()
    }

    pub fn set_block_size(&self, block_size: u32) -> Result<()> {
        if block_size == 0 {
            return Err(Ext2Error::InvalidGeometry("zero channel block size".into()));
        }
        self.inner.block_size.store(block_size);
        Ok(())
    }

    pub fn flags(&self) -> ChannelFlags {
        self.inner.flags.load()
    }

    pub fn set_flags(&self, flags: ChannelFlags) {
        self.inner.flags.store(flags);
    }

    /// Number of handles holding this channel
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both values refer to the same underlying channel.
    pub fn same_channel(&self, other: &IoChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_error_handler(&self, handler: Option<Arc<dyn IoErrorHandler>>) {
        *self.inner.handler.write() = handler;
    }

    pub fn has_error_handler(&self) -> bool {
        self.inner.handler.read().is_some()
    }

    /// Device size in whole blocks
    pub fn size_blocks(&self) -> u64 {
        self.inner.device.lock().size() / u64::from(self.block_size())
    }

    pub fn stats(&self) -> ChannelStats {
        let c = &self.inner.counters;
        ChannelStats {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
        }
    }

    fn span(&self, block: u64, count: usize, buf_len: usize) -> Result<(u64, usize)> {
        let bs = self.block_size() as usize;
        let size = count
            .checked_mul(bs)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "transfer too large"))?;
        if buf_len < size {
            return Err(Ext2Error::BufferTooSmall {
                needed: size,
                got: buf_len,
            });
        }
        let offset = block
            .checked_mul(bs as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block offset overflow"))?;
        Ok((offset, size))
    }

    fn handler(&self) -> Option<Arc<dyn IoErrorHandler>> {
        self.inner.handler.read().clone()
    }

    fn context(block: u64, count: usize) -> IoErrorContext {
        IoErrorContext {
            block,
            count,
            operation: current_operation(),
        }
    }

    /// Read `count` blocks starting at `block` into `buf`.
    pub fn read_blk(&self, block: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let (offset, size) = self.span(block, count, buf.len())?;
        let buf = &mut buf[..size];

        let result = self.inner.device.lock().read_at(offset, buf);
        self.inner.counters.reads.fetch_add(1, Ordering::Relaxed);

        let failure = match result {
            Ok(n) if n == size => {
                self.inner
                    .counters
                    .bytes_read
                    .fetch_add(n as u64, Ordering::Relaxed);
                return Ok(());
            }
            Ok(n) => Failure::Short(n),
            Err(e) => Failure::Device(e),
        };

        // Device lock is released before the handler runs; it may retry.
        match self.handler() {
            Some(handler) => {
                let ctx = Self::context(block, count);
                handler.on_read_error(self, &ctx, buf, failure.into_io(size))
            }
            None => Err(match failure {
                Failure::Short(_) => Ext2Error::ShortRead {
                    block,
                    wanted: size,
                },
                Failure::Device(e) => Ext2Error::Io(e),
            }),
        }
    }

    /// Write `count` blocks starting at `block` from `buf`.
    pub fn write_blk(&self, block: u64, count: usize, buf: &[u8]) -> Result<()> {
        let (offset, size) = self.span(block, count, buf.len())?;
        let buf = &buf[..size];

        let result = self.inner.device.lock().write_at(offset, buf);
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);

        let failure = match result {
            Ok(n) if n == size => {
                self.inner
                    .counters
                    .bytes_written
                    .fetch_add(n as u64, Ordering::Relaxed);
                return Ok(());
            }
            Ok(n) => Failure::Short(n),
            Err(e) => Failure::Device(e),
        };

        match self.handler() {
            Some(handler) => {
                let ctx = Self::context(block, count);
                handler.on_write_error(self, &ctx, buf, failure.into_io(size))
            }
            None => Err(match failure {
                Failure::Short(_) => Ext2Error::ShortWrite {
                    block,
                    wanted: size,
                },
                Failure::Device(e) => Ext2Error::Io(e),
            }),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.device.lock().flush()?;
        Ok(())
    }
}
