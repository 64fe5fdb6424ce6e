//! The overflow data file: append/update I/O plus the `fallocate` modes the
//! head-truncation pass needs.
//!
//! Head truncation removes a whole-MiB prefix of the file with
//! `FALLOC_FL_COLLAPSE_RANGE`. Filesystem support for collapse-range varies,
//! so construction probes it once against a throwaway `mkstemp` file in the
//! same directory (collapse support is a per-filesystem property) and the
//! cached result gates every later attempt.

use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{fallocate, FallocateFlags};
use qmq_error::{QmqError, Result};
use tracing::debug;

use crate::posix::PosixFile;

/// Granularity of head truncation. Collapsed prefixes are always a multiple
/// of this.
pub const HEAD_TRUNCATION_CHUNK: u64 = 1024 * 1024;

/// The shared append-only data file of the overflow store.
#[derive(Debug)]
pub struct DataFile {
    file: PosixFile,
    collapse_supported: bool,
}

impl DataFile {
    /// Open (creating if absent) `dir/name` and probe collapse-range
    /// support on the directory's filesystem.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let file = PosixFile::open(dir, name)?;
        let collapse_supported = probe_collapse_support(dir);
        debug!(
            file = name,
            collapse_supported, "opened overflow data file"
        );
        Ok(Self {
            file,
            collapse_supported,
        })
    }

    /// Whether the filesystem supports removing a file prefix in place.
    #[must_use]
    pub fn head_truncation_supported(&self) -> bool {
        self.collapse_supported
    }

    /// Remove the largest whole-MiB prefix not exceeding `max_bytes`.
    ///
    /// Returns the number of bytes actually removed (possibly 0). The file
    /// offset is left untouched by the kernel; callers re-seek afterwards.
    pub fn truncate_head(&mut self, max_bytes: u64) -> Result<u64> {
        debug_assert!(self.collapse_supported, "collapse-range gated by probe");
        let amount = max_bytes - (max_bytes % HEAD_TRUNCATION_CHUNK);
        if amount == 0 {
            return Ok(0);
        }
        self.fallocate_op(
            "fallocate(COLLAPSE_RANGE)",
            FallocateFlags::FALLOC_FL_COLLAPSE_RANGE,
            0,
            amount,
        )?;
        debug!(file = self.file.name(), amount, "collapsed data file head");
        Ok(amount)
    }

    /// Fill `[offset, offset + len)` with zero bytes without changing the
    /// file length.
    pub fn zero_range(&mut self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.fallocate_op(
            "fallocate(ZERO_RANGE)",
            FallocateFlags::FALLOC_FL_ZERO_RANGE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    }

    /// Preallocate `[offset, offset + len)`.
    pub fn allocate(&mut self, offset: u64, len: u64) -> Result<()> {
        self.fallocate_op("fallocate", FallocateFlags::empty(), offset, len)
    }

    fn fallocate_op(
        &mut self,
        op: &'static str,
        flags: FallocateFlags,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let fd = self.file.raw_fd(op)?;
        let offset = to_off_t(offset, self.file.name(), op)?;
        let len = to_off_t(len, self.file.name(), op)?;
        loop {
            match fallocate(fd, flags, offset, len) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(QmqError::io(self.file.name(), op, io::Error::from(e)));
                }
            }
        }
    }

    /// Access to the plain POSIX operations of the underlying file.
    pub fn file(&mut self) -> &mut PosixFile {
        &mut self.file
    }

    /// Read-only access to the underlying file.
    pub fn file_ref(&self) -> &PosixFile {
        &self.file
    }
}

/// Probe whether `dir`'s filesystem supports `FALLOC_FL_COLLAPSE_RANGE`.
///
/// Creates an anonymous temp file, allocates 1 MiB + 100 bytes, collapses
/// 1 MiB, and checks that exactly 100 bytes remain. Any failure, including
/// an unexpected resulting size, reports lack of support.
fn probe_collapse_support(dir: &Path) -> bool {
    let template = dir.join("qmq-probe-XXXXXX");
    let (fd, path) = match nix::unistd::mkstemp(&template) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "collapse probe could not create temp file");
            return false;
        }
    };
    // Unlink immediately; the descriptor keeps the inode alive.
    let _ = nix::unistd::unlink(&path);

    let chunk = off_t_chunk();
    let supported = fallocate(fd, FallocateFlags::empty(), 0, chunk + 100).is_ok()
        && fallocate(fd, FallocateFlags::FALLOC_FL_COLLAPSE_RANGE, 0, chunk).is_ok()
        && nix::sys::stat::fstat(fd).map(|st| st.st_size == 100).unwrap_or(false);

    let _ = nix::unistd::close(fd);
    debug!(supported, "collapse-range capability probe");
    supported
}

fn off_t_chunk() -> i64 {
    i64::try_from(HEAD_TRUNCATION_CHUNK).expect("1 MiB fits in off_t")
}

fn to_off_t(value: u64, file: &str, op: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        QmqError::io(
            file,
            op,
            io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds off_t"),
        )
    })
}
