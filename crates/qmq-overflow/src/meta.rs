//! Per-channel bookkeeping inside the overflow store.

use qmq_types::{ChannelStats, RecordHeader};

/// Metadata for one channel of the overflow store.
///
/// The invariants tie the counters to the offsets: an empty channel has no
/// offsets and no cached header, a single-record channel has coinciding
/// first and last offsets, and a longer chain has strictly ascending ones.
/// `records > 0` also implies the channel is tracked by the first-offset
/// tracker; the engine maintains that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMeta {
    /// Channel id, unique among live channels, constant for the channel's
    /// lifetime. Always > 0.
    pub id: u32,
    /// Counters and first/last offsets as persisted in the index.
    pub stats: ChannelStats,
    /// Copy of the most recent record's header, rewritten in place when the
    /// next push links a successor to it.
    pub last_header: RecordHeader,
}

impl ChannelMeta {
    /// Fresh empty metadata for a newly allocated channel id.
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self {
            id,
            stats: ChannelStats::default(),
            last_header: RecordHeader::default(),
        }
    }

    /// Clear everything except the id (the channel keeps its identity).
    pub fn reset(&mut self) {
        self.stats = ChannelStats::default();
        self.last_header = RecordHeader::default();
    }

    /// Whether the channel currently holds no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stats.records == 0
    }

    /// Check the full metadata invariants.
    ///
    /// With `id == 0` the id-dependent checks are skipped (index parsing
    /// validates lines before the id is recovered from the data file).
    pub fn validate(&self) -> Result<(), String> {
        self.stats.validate()?;
        if self.stats.records == 0 {
            if self.last_header != RecordHeader::default() {
                return Err("empty channel with cached last header".to_owned());
            }
            return Ok(());
        }
        if self.id != 0 {
            if self.last_header.channel_id != self.id {
                return Err(format!(
                    "cached last header belongs to channel {} (expected {})",
                    self.last_header.channel_id, self.id
                ));
            }
            if self.last_header.next_offset != 0 {
                return Err("cached last header has a successor".to_owned());
            }
        }
        Ok(())
    }
}
