//! File access used by the file-backed store
//!
//! Every read, write, sync and truncate goes through a [`FileOps`] so
//! failures can be injected in tests.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Low-level file operations
pub trait FileOps: Send + Sync {
    /// Open a file for reading and writing, creating it if asked
    fn open(&self, path: &Path, create: bool) -> io::Result<File>;

    /// Fill `buf` from `offset`
    fn read_at(&self, file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `buf` at `offset`
    fn write_at(&self, file: &mut File, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Make previous writes durable
    fn sync(&self, file: &mut File) -> io::Result<()>;

    /// Cut the file to `len` bytes
    fn truncate(&self, file: &mut File, len: u64) -> io::Result<()>;

    /// Current file length
    fn len(&self, file: &mut File) -> io::Result<u64>;
}

/// Sequential [`Read`] over the first `end` bytes of a file, through [`FileOps`]
pub(crate) struct OpsReader<'a> {
    ops: &'a dyn FileOps,
    file: &'a mut File,
    pos: u64,
    end: u64,
}

impl<'a> OpsReader<'a> {
    pub fn new(ops: &'a dyn FileOps, file: &'a mut File, end: u64) -> Self {
        Self {
            ops,
            file,
            pos: 0,
            end,
        }
    }
}

impl Read for OpsReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.end.saturating_sub(self.pos)) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.ops.read_at(self.file, self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Plain `std::fs` implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFileOps;

impl FileOps for DefaultFileOps {
    fn open(&self, path: &Path, create: bool) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
    }

    fn read_at(&self, file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_at(&self, file: &mut File, offset: u64, buf: &[u8]) -> io::Result<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn sync(&self, file: &mut File) -> io::Result<()> {
        file.sync_all()
    }

    fn truncate(&self, file: &mut File, len: u64) -> io::Result<()> {
        file.set_len(len)
    }

    fn len(&self, file: &mut File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }
}
