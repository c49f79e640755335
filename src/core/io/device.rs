//! Reference block devices

use super::BlockDevice;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// In-memory image
#[derive(Debug, Clone, Default)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    /// Zero-filled image of `len` bytes
    pub fn new(len: usize) -> Self {
        MemDevice { data: vec![0; len] }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemDevice { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn span(&self, offset: u64, len: usize) -> io::Result<(usize, usize)> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        if start > self.data.len() {
            return Ok((self.data.len(), self.data.len()));
        }
        Ok((start, (start + len).min(self.data.len())))
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let (start, end) = self.span(offset, buf.len())?;
        let n = end - start;
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let (start, end) = self.span(offset, buf.len())?;
        let n = end - start;
        self.data[start..end].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Image file on disk
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileDevice {
    /// Create (or truncate) an image of `len` bytes.
    pub fn create<P: AsRef<Path>>(path: P, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len)?;

        Ok(FileDevice {
            file,
            path: path.as_ref().to_path_buf(),
            len,
        })
    }

    /// Open an existing image read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        Ok(FileDevice {
            file,
            path: path.as_ref().to_path_buf(),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.len = self.len.max(offset + buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    fn size(&self) -> u64 {
        self.len
    }
}
