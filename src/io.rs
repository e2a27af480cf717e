//! Positioned disk I/O for the store's backing file.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk-backed block storage.
///
/// Every access is a positioned read or write; no seek position is carried
/// between calls, so multiple views of the file can share one handle as
/// long as their operations are serialized.
pub struct BlockFile {
    file: File,
    path: PathBuf,
}

impl BlockFile {
    /// Open the backing file, creating it when writable and absent.
    ///
    /// In read-only mode the file must already exist.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?
        };

        Ok(BlockFile {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate or extend the file to exactly `n` bytes.
    pub fn set_len(&mut self, n: u64) -> Result<()> {
        self.file.set_len(n)?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// The portion of the buffer past end-of-file reads as zeros; the
    /// returned count is the number of bytes physically present.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        if done < buf.len() {
            buf[done..].fill(0);
        }
        Ok(done)
    }

    /// Write all of `buf` starting at `offset`, extending the file as
    /// needed.
    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Sync file contents and metadata to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.cap");

        let mut file = BlockFile::open(&path, false).unwrap();
        assert!(file.is_empty().unwrap());

        file.write_all_at(512, b"hello").unwrap();
        assert_eq!(file.len().unwrap(), 517);

        let mut buf = [0u8; 5];
        file.read_exact_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_read_only_requires_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.cap");

        assert!(BlockFile::open(&path, true).is_err());

        BlockFile::open(&path, false).unwrap();
        assert!(BlockFile::open(&path, true).is_ok());
    }

    #[test]
    fn test_read_at_zero_fills_past_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.cap");

        let mut file = BlockFile::open(&path, false).unwrap();
        file.write_all_at(0, b"abc").unwrap();

        let mut buf = [0xFFu8; 8];
        let n = file.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"abc\0\0\0\0\0");

        let n = file.read_at(100, &mut buf).unwrap();
        assert_eq!(n, 0);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_set_len() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trunc.cap");

        let mut file = BlockFile::open(&path, false).unwrap();
        file.set_len(1024).unwrap();
        assert_eq!(file.len().unwrap(), 1024);

        file.set_len(256).unwrap();
        assert_eq!(file.len().unwrap(), 256);
    }
}
