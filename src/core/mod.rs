//! Core implementation: bitmaps, handles, I/O and the parallel scan driver

pub mod badblocks;
pub mod bitmap;
pub mod config;
pub mod dblist;
pub mod ehandler;
pub mod error;
pub mod fs;
pub mod icache;
pub mod io;
pub mod scan;
pub mod superblock;

pub use fs::Filesystem;
