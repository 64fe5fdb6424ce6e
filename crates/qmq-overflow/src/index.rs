//! Text persistence of per-channel metadata.
//!
//! One ASCII line per non-empty channel:
//! ```text
//! <storage_name> <records> <bytes> <first_offset> <last_offset>
//! ```
//! The channel id is deliberately absent; recovery re-derives it from the
//! header of the channel's first record. Parsing is strict: bad charset,
//! wrong field count, malformed numbers, and a file that ends in the middle
//! of a record are all distinct errors, while trailing whitespace and blank
//! final lines are tolerated.
//!
//! The rewrite runs with all non-fatal signals blocked: a formatted stream
//! write cannot be restarted after an interruption, and a half-written
//! index is indistinguishable from a corrupt one at the next startup.

use std::fmt::Write as _;
use std::path::Path;

use qmq_error::{QmqError, Result};
use qmq_types::{ChannelStats, StorageName};
use qmq_vfs::{with_signals_blocked, PosixFile};

/// The channel index file beside the overflow data file.
#[derive(Debug)]
pub struct IndexFile {
    file: PosixFile,
}

impl IndexFile {
    /// Open (creating if absent) `dir/name`.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        Ok(Self {
            file: PosixFile::open(dir, name)?,
        })
    }

    /// File name used in error reports.
    #[must_use]
    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Parse every line, delivering `(name, stats, line_number)` to the
    /// handler. Line numbers are 1-based.
    pub fn read_entries(
        &mut self,
        mut handler: impl FnMut(&StorageName, ChannelStats, u32) -> Result<()>,
    ) -> Result<()> {
        let size = self.file.size()?;
        let size = usize::try_from(size)
            .map_err(|_| QmqError::recovery("index file larger than memory"))?;
        let mut raw = vec![0u8; size];
        self.file.pread_exact(&mut raw, 0)?;
        let text = std::str::from_utf8(&raw).map_err(|_| self.parse_err(1, "not ASCII text"))?;

        for (index, line) in text.split('\n').enumerate() {
            let line_no = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue; // blank or whitespace-only line
            }
            if tokens.len() != 5 {
                // A short final line means the file ends mid-record; any
                // other count is a field mismatch.
                let at_eof = tokens.len() < 5
                    && text
                        .split('\n')
                        .skip(index + 1)
                        .all(|rest| rest.trim().is_empty());
                let detail = if at_eof {
                    format!("unexpected end of file after {} of 5 fields", tokens.len())
                } else {
                    format!("expected 5 fields, got {}", tokens.len())
                };
                return Err(self.parse_err(line_no, detail));
            }

            let name = StorageName::parse(tokens[0])
                .map_err(|e| self.parse_err(line_no, e.to_string()))?;
            let records = self.parse_u64(tokens[1], "records", line_no)?;
            let bytes = self.parse_u64(tokens[2], "bytes", line_no)?;
            let first_offset = self.parse_offset(tokens[3], "first_offset", line_no)?;
            let last_offset = self.parse_offset(tokens[4], "last_offset", line_no)?;

            let stats = ChannelStats {
                records,
                bytes,
                first_offset,
                last_offset,
            };
            stats
                .validate()
                .map_err(|detail| self.parse_err(line_no, detail))?;
            handler(&name, stats, line_no)?;
        }
        Ok(())
    }

    /// Truncate and rewrite the index from the given entries, one line per
    /// channel, buffered into a single write under a blocked signal mask.
    pub fn write_entries<'a>(
        &mut self,
        entries: impl Iterator<Item = (&'a str, ChannelStats)>,
    ) -> Result<()> {
        let mut out = String::new();
        for (name, stats) in entries {
            writeln!(
                out,
                "{name} {} {} {} {}",
                stats.records, stats.bytes, stats.first_offset, stats.last_offset
            )
            .expect("formatting into a String cannot fail");
        }
        with_signals_blocked(|| {
            self.file.reset()?;
            self.file.write(out.as_bytes())
        })
    }

    /// Truncate to zero length.
    pub fn reset(&mut self) -> Result<()> {
        self.file.reset()
    }

    /// Close the descriptor.
    pub fn close(&mut self) -> Result<()> {
        self.file.close()
    }

    /// Unlink the file and close the descriptor.
    pub fn remove(&mut self) -> Result<()> {
        self.file.remove()
    }

    fn parse_err(&self, line: u32, detail: impl Into<String>) -> QmqError {
        QmqError::IndexParse {
            file: self.file.name().to_owned(),
            line,
            detail: detail.into(),
        }
    }

    fn parse_u64(&self, token: &str, field: &str, line: u32) -> Result<u64> {
        token
            .parse::<u64>()
            .map_err(|_| self.parse_err(line, format!("malformed {field}: '{token}'")))
    }

    fn parse_offset(&self, token: &str, field: &str, line: u32) -> Result<u64> {
        let value = token
            .parse::<i64>()
            .map_err(|_| self.parse_err(line, format!("malformed {field}: '{token}'")))?;
        u64::try_from(value)
            .map_err(|_| self.parse_err(line, format!("negative {field}: {value}")))
    }
}
