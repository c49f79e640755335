//! Library configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! bitmap_backend = "bit_array"
//! scan_workers = 4
//! icache_size = 512
//!
//! [channel]
//! threads = true
//!
//! [ehandler]
//! install = true
//! preen = false
//! answer = true
//! ```
//!
//! Every key is optional.

use crate::bitmap::BackendType;
use crate::ehandler::EhandlerPolicy;
use crate::error::{Ext2Error, Result};
use crate::io::ChannelFlags;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_ICACHE_SIZE: usize = 256;

/// I/O channel settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub threads: bool,
    pub nocache: bool,
}

impl ChannelConfig {
    pub fn flags(&self) -> ChannelFlags {
        let mut flags = ChannelFlags::empty();
        flags.set(ChannelFlags::THREADS, self.threads);
        flags.set(ChannelFlags::NOCACHE, self.nocache);
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend for bitmaps allocated by filesystem handles
    pub bitmap_backend: BackendType,
    /// Worker threads for parallel scans; 0 uses the available parallelism
    pub scan_workers: usize,
    /// Inode location cache capacity
    pub icache_size: usize,
    pub channel: ChannelConfig,
    pub ehandler: EhandlerPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bitmap_backend: BackendType::default(),
            scan_workers: 0,
            icache_size: DEFAULT_ICACHE_SIZE,
            channel: ChannelConfig::default(),
            ehandler: EhandlerPolicy::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Ext2Error::Config(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Ext2Error::Config(e.to_string()))
    }

    /// Worker count with 0 resolved to the machine's parallelism.
    pub fn effective_workers(&self) -> usize {
        match self.scan_workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

/// Programmatic [`Config`] construction
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    pub fn bitmap_backend(mut self, backend: BackendType) -> Self {
        self.config.bitmap_backend = backend;
        self
    }

    pub fn scan_workers(mut self, workers: usize) -> Self {
        self.config.scan_workers = workers;
        self
    }

    pub fn icache_size(mut self, size: usize) -> Self {
        self.config.icache_size = size;
        self
    }

    pub fn threaded_channel(mut self, threads: bool) -> Self {
        self.config.channel.threads = threads;
        self
    }

    pub fn ehandler(mut self, policy: EhandlerPolicy) -> Self {
        self.config.ehandler = policy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
