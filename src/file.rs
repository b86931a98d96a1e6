//! Block device abstraction over a path: sized random read/write, resize,
//! and a temporary-file factory. Mirrors the role of `moderndbs::File` /
//! `PosixFile` in the original source, simplified to what the buffer
//! manager actually needs (no checksums, no header page: that bookkeeping
//! belongs to higher layers in this spec, unlike the teacher's
//! `BlockFile`, which folds it in).

use std::fs::{File as StdFile, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A single named, resizable file supporting random-access block I/O.
#[derive(Debug)]
pub struct File {
    file: StdFile,
    path: Option<PathBuf>,
}

impl File {
    /// Open (creating if necessary) the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            file,
            path: Some(path),
        })
    }

    /// Create an anonymous temporary file, auto-destroyed once dropped.
    pub fn make_temporary() -> Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self { file, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current length in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Grow or shrink the file to exactly `len` bytes.
    pub fn resize(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write `buf` at `offset`, growing the file if necessary.
    pub fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if self.size()? < end {
            self.resize(end)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let mut file = File::make_temporary().unwrap();
        file.resize(16).unwrap();
        file.write_block(4, b"hello").unwrap();
        let mut buf = [0u8; 5];
        file.read_block(4, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_past_end_grows_file() {
        let mut file = File::make_temporary().unwrap();
        file.write_block(100, b"x").unwrap();
        assert_eq!(file.size().unwrap(), 101);
    }

    #[test]
    fn named_file_persists_across_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("42");
        {
            let mut f = File::open(&path).unwrap();
            f.resize(8).unwrap();
            f.write_block(0, &8u64.to_le_bytes()).unwrap();
        }
        let mut f = File::open(&path).unwrap();
        let mut buf = [0u8; 8];
        f.read_block(0, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 8);
    }
}
