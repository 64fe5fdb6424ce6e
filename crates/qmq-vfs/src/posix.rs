//! EINTR-safe wrapper around one regular file opened read-write.
//!
//! Positioned I/O goes through `std::os::unix::fs::FileExt`; the calls std
//! does not expose (`writev`, `fdatasync`, `unlink`) go through `nix`. Every
//! error is converted to [`QmqError::Io`] carrying the file name, the errno,
//! and the name of the failing operation.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use qmq_error::{QmqError, Result};

/// One open file of the node's data directory.
///
/// The descriptor stays open until [`close`](PosixFile::close) or
/// [`remove`](PosixFile::remove); calling any other method afterwards is a
/// logic error and reports `EBADF`-style failure instead of panicking in
/// release builds.
#[derive(Debug)]
pub struct PosixFile {
    file: Option<File>,
    path: PathBuf,
    name: String,
}

impl PosixFile {
    /// Open (creating if absent) `dir/name` with read-write access.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = retry_io(|| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o644)
                .open(&path)
        })
        .map_err(|e| QmqError::io(name, "open", e))?;
        Ok(Self {
            file: Some(file),
            path,
            name: name.to_owned(),
        })
    }

    /// The file name (without directory) used in error reports.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the descriptor is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// The raw descriptor, for syscalls std does not expose.
    pub fn raw_fd(&self, op: &'static str) -> Result<i32> {
        Ok(self.handle(op)?.as_raw_fd())
    }

    fn handle(&self, op: &'static str) -> Result<&File> {
        debug_assert!(self.file.is_some(), "{op} on closed file {}", self.name);
        self.file
            .as_ref()
            .ok_or_else(|| QmqError::io(&self.name, op, io::Error::other("file is closed")))
    }

    fn err(&self, op: &'static str, e: io::Error) -> QmqError {
        QmqError::io(&self.name, op, e)
    }

    /// Reposition the file offset.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.handle("lseek")?;
        let file = self.file.as_mut().expect("checked above");
        file.seek(pos).map_err(|e| QmqError::io(&self.name, "lseek", e))
    }

    /// Seek to the end of the file, returning its size.
    pub fn seek_end(&mut self) -> Result<u64> {
        self.seek(SeekFrom::End(0))
    }

    /// Current file size from `fstat`.
    pub fn size(&self) -> Result<u64> {
        let file = self.handle("fstat")?;
        let meta = file.metadata().map_err(|e| self.err("fstat", e))?;
        Ok(meta.len())
    }

    /// Read at the current position, filling as much of `buf` as the file
    /// yields before EOF. Returns the number of bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.handle("read")?;
        let file = self.file.as_mut().expect("checked above");
        let mut filled = 0;
        while filled < buf.len() {
            match retry_io(|| (&*file).read(&mut buf[filled..])) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(QmqError::io(&self.name, "read", e)),
            }
        }
        Ok(filled)
    }

    /// Write all of `buf` at the current position.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.handle("write")?;
        let file = self.file.as_mut().expect("checked above");
        let mut written = 0;
        while written < buf.len() {
            match retry_io(|| (&*file).write(&buf[written..])) {
                Ok(0) => {
                    return Err(QmqError::io(
                        &self.name,
                        "write",
                        io::Error::new(io::ErrorKind::WriteZero, "write returned 0"),
                    ));
                }
                Ok(n) => written += n,
                Err(e) => return Err(QmqError::io(&self.name, "write", e)),
            }
        }
        Ok(())
    }

    /// Positioned read. Returns the number of bytes actually read (short at
    /// EOF).
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.handle("pread")?;
        let mut filled = 0;
        while filled < buf.len() {
            match retry_io(|| file.read_at(&mut buf[filled..], offset + filled as u64)) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(self.err("pread", e)),
            }
        }
        Ok(filled)
    }

    /// Positioned read that fails unless the whole buffer could be filled.
    pub fn pread_exact(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let filled = self.pread(buf, offset)?;
        if filled < buf.len() {
            return Err(QmqError::ShortRead {
                file: self.name.clone(),
                offset,
                expected: buf.len(),
                actual: filled,
            });
        }
        Ok(())
    }

    /// Positioned write of the whole buffer.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        let file = self.handle("pwrite")?;
        let mut written = 0;
        while written < buf.len() {
            match retry_io(|| file.write_at(&buf[written..], offset + written as u64)) {
                Ok(0) => {
                    return Err(self.err(
                        "pwrite",
                        io::Error::new(io::ErrorKind::WriteZero, "pwrite returned 0"),
                    ));
                }
                Ok(n) => written += n,
                Err(e) => return Err(self.err("pwrite", e)),
            }
        }
        Ok(())
    }

    /// Gather-write all buffers at the current position.
    ///
    /// A short `writev` is resumed with a byte cursor across the scatter
    /// vector, so callers always see all-or-error.
    pub fn writev_all(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let file = self.handle("writev")?;
        let fd = file.as_raw_fd();
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = 0usize;
        let mut slices = Vec::with_capacity(bufs.len());
        while written < total {
            slices.clear();
            let mut skip = written;
            for buf in bufs {
                if skip >= buf.len() {
                    skip -= buf.len();
                    continue;
                }
                slices.push(IoSlice::new(&buf[skip..]));
                skip = 0;
            }
            match nix::sys::uio::writev(fd, &slices) {
                Ok(0) => {
                    return Err(self.err(
                        "writev",
                        io::Error::new(io::ErrorKind::WriteZero, "writev returned 0"),
                    ));
                }
                Ok(n) => written += n,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(self.err("writev", io::Error::from(e))),
            }
        }
        Ok(())
    }

    /// Truncate to zero length and rewind.
    pub fn reset(&mut self) -> Result<()> {
        {
            let file = self.handle("ftruncate")?;
            retry_io(|| file.set_len(0)).map_err(|e| self.err("ftruncate", e))?;
        }
        self.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// `fdatasync` the file contents.
    pub fn datasync(&self) -> Result<()> {
        let file = self.handle("fdatasync")?;
        retry_io(|| file.sync_data()).map_err(|e| self.err("fdatasync", e))
    }

    /// Close the descriptor, surfacing the close error if any.
    pub fn close(&mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| QmqError::io(&self.name, "close", io::Error::other("file is closed")))?;
        // No EINTR retry: on Linux the descriptor is gone either way.
        let fd = std::os::fd::IntoRawFd::into_raw_fd(file);
        nix::unistd::close(fd).map_err(|e| self.err("close", io::Error::from(e)))
    }

    /// Unlink the file from its directory, then close the descriptor.
    pub fn remove(&mut self) -> Result<()> {
        self.handle("unlink")?;
        nix::unistd::unlink(&self.path)
            .map_err(|e| self.err("unlink", io::Error::from(e)))?;
        self.close()
    }
}

/// Retry a std I/O operation for as long as it reports `EINTR`.
pub(crate) fn retry_io<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}
