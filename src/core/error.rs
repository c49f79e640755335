use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Runtime type discriminator carried by handles, bitmaps and lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    Filesystem,
    GenericBitmap,
    BlockBitmap,
    InodeBitmap,
    BadBlocksList,
    DirBlockList,
    IoChannel,
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Magic::Filesystem => "filesystem handle",
            Magic::GenericBitmap => "generic bitmap",
            Magic::BlockBitmap => "block bitmap",
            Magic::InodeBitmap => "inode bitmap",
            Magic::BadBlocksList => "bad blocks list",
            Magic::DirBlockList => "directory block list",
            Magic::IoChannel => "I/O channel",
        };
        f.write_str(name)
    }
}

/// Which kind of structure a comparison found to differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MismatchKind {
    BlockBitmap,
    InodeBitmap,
    GenericBitmap,
    BadBlocksList,
    DirBlockList,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MismatchKind::BlockBitmap => "block bitmap differs",
            MismatchKind::InodeBitmap => "inode bitmap differs",
            MismatchKind::GenericBitmap => "generic bitmap differs",
            MismatchKind::BadBlocksList => "bad blocks list differs",
            MismatchKind::DirBlockList => "directory block list differs",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Ext2Error {
    #[error("Out of memory")]
    NoMemory,

    #[error("Illegal {kind} index {index} (valid range {start}..={end})")]
    BitmapRange {
        kind: Magic,
        index: u64,
        start: u64,
        end: u64,
    },

    #[error("Invalid bitmap domain: start {start}, end {end}, real end {real_end}")]
    InvalidDomain { start: u64, end: u64, real_end: u64 },

    #[error("Buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("Wrong magic number: expected {expected}, found {found}")]
    MagicMismatch { expected: Magic, found: Magic },

    #[error("Comparison failed: {0}")]
    BitmapDiffers(MismatchKind),

    #[error("Structure is shared with another handle and cannot be modified: {0}")]
    SharedStructure(&'static str),

    #[error("Interval-tree bitmaps cannot be scanned by several threads at once")]
    SharedScanUnsupported,

    #[error("Handle is not a clone of this filesystem")]
    NotAChild,

    #[error("Filesystem handle still has {0} outstanding clones")]
    ChildrenOutstanding(i64),

    #[error("Cannot duplicate multiple-mount protection file: {0}")]
    MmpOpen(std::io::Error),

    #[error("Invalid filesystem geometry: {0}")]
    InvalidGeometry(String),

    #[error("Directory block for inode {ino} at index {blockcnt} not found")]
    DirBlockNotFound { ino: u32, blockcnt: i64 },

    #[error("Group number {0} out of range")]
    BadGroupNum(u32),

    #[error("{0} is not loaded")]
    NotLoaded(&'static str),

    #[error("Inode number {0} out of range")]
    BadInodeNum(u64),

    #[error("Short read at block {block}: wanted {wanted} bytes")]
    ShortRead { block: u64, wanted: usize },

    #[error("Short write at block {block}: wanted {wanted} bytes")]
    ShortWrite { block: u64, wanted: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scan worker for groups {range:?} failed: {source}")]
    Worker {
        range: Range<u32>,
        #[source]
        source: Box<Ext2Error>,
    },
}

impl Ext2Error {
    /// Check a runtime discriminator against the expected one.
    pub fn check_magic(expected: Magic, found: Magic) -> Result<()> {
        if expected == found {
            Ok(())
        } else {
            Err(Ext2Error::MagicMismatch { expected, found })
        }
    }
}

pub type Result<T> = std::result::Result<T, Ext2Error>;
