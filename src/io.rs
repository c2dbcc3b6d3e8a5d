//! L0 — byte-IO (spec §4.1).
//!
//! Positional read/write/append/truncate against a single file, an
//! advisory exclusive lock for the life of `VolumeOpen`, and a
//! `commit` that flushes and fsyncs. Writes are not durable until
//! `commit` runs.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{MyfsError, Result};

pub struct ByteIo {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl ByteIo {
    /// Open an existing file for read/write positional access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(ByteIo { file, path, locked: false })
    }

    /// Create a brand-new file, failing if one already exists (spec §4.6 Format).
    pub fn create_new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        Ok(ByteIo { file, path, locked: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Advisory exclusive lock for the duration of `VolumeOpen` (spec §5).
    /// A second process attempting to open the same container fails `Locked`.
    pub fn lock_exclusive(&mut self) -> Result<()> {
        self.file.try_lock_exclusive().map_err(|_| MyfsError::Locked)?;
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(&self.file);
            self.locked = false;
        }
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Append `data` at the current end of file, returning the offset it landed at.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        Ok(offset)
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flush and fsync. Durability of everything written before this
    /// call is only guaranteed once it returns (spec §4.1).
    pub fn commit(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for ByteIo {
    fn drop(&mut self) {
        self.unlock();
    }
}
