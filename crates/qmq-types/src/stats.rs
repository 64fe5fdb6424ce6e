//! Per-channel record accounting as persisted in the index file.

use crate::header::DATA_FILE_MAGIC;

/// Record counts and offsets for one channel of the overflow store.
///
/// This is the value persisted per index line; the full in-engine metadata
/// additionally carries the channel id and the cached last header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Records pushed and not yet popped.
    pub records: u64,
    /// Sum of payload lengths of those records.
    pub bytes: u64,
    /// File offset of the next record to pop; 0 when empty.
    pub first_offset: u64,
    /// File offset of the most recent record; 0 when empty.
    pub last_offset: u64,
}

impl ChannelStats {
    /// Check the zero/one/many invariants that every channel obeys.
    ///
    /// Returns a description of the first violated invariant, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.records == 0 {
            if self.bytes != 0 || self.first_offset != 0 || self.last_offset != 0 {
                return Err(format!(
                    "empty channel with nonzero state (bytes {}, first {}, last {})",
                    self.bytes, self.first_offset, self.last_offset
                ));
            }
            return Ok(());
        }
        if self.first_offset < DATA_FILE_MAGIC.len() as u64 {
            return Err(format!(
                "first offset {} overlaps the file magic",
                self.first_offset
            ));
        }
        match self.records {
            1 => {
                if self.first_offset != self.last_offset {
                    return Err(format!(
                        "single record but first {} != last {}",
                        self.first_offset, self.last_offset
                    ));
                }
            }
            _ => {
                if self.first_offset >= self.last_offset {
                    return Err(format!(
                        "{} records but first {} >= last {}",
                        self.records, self.first_offset, self.last_offset
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether the channel holds no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records == 0
    }
}
