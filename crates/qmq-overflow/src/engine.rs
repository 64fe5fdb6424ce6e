//! The disk overflow engine.
//!
//! Owns the data file and the index file, the per-channel metadata, the
//! first-offset tracker, and the global counters. Records of one channel
//! form a singly-linked list threaded through the data file: each header's
//! `next_offset` is the byte distance to the channel's next record, patched
//! in place when a successor is appended.
//!
//! Durability model: `flush` (head-minimize + index rewrite + `fdatasync`)
//! is the only barrier. Records pushed or popped since the last flush may
//! replay after a crash; recovery validates what the index claims against
//! the record headers themselves and aborts startup on any inconsistency.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use qmq_error::{QmqError, Result};
use qmq_types::{
    ChannelStats, RecordHeader, DATA_FILE_MAGIC, DATA_FILE_NAME, INDEX_FILE_NAME,
};
use qmq_vfs::DataFile;
use tracing::{debug, error, warn};

use crate::index::IndexFile;
use crate::meta::ChannelMeta;
use crate::tracker::FirstOffsetTracker;

const MAGIC_LEN: u64 = DATA_FILE_MAGIC.len() as u64;
const HEADER_LEN: u64 = RecordHeader::SIZE as u64;

/// The shared disk overflow store of one data directory.
#[derive(Debug)]
pub struct OverflowEngine {
    data: DataFile,
    index: IndexFile,
    channels: HashMap<String, ChannelMeta>,
    tracker: FirstOffsetTracker,
    /// Records across all channels, not yet popped.
    records: u64,
    /// Payload bytes across all channels, not yet popped.
    bytes: u64,
    highest_channel_id: u32,
    closed: bool,
}

impl OverflowEngine {
    /// Open the overflow store in `dir`, recovering any prior state.
    ///
    /// Recovery is strict: a malformed index line, a header that fails its
    /// parity check, duplicate ids or offsets, or a data file smaller than
    /// the index's totals all abort startup.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut data = DataFile::open(dir, DATA_FILE_NAME)?;
        let mut index = IndexFile::open(dir, INDEX_FILE_NAME)?;

        let mut channels: HashMap<String, ChannelMeta> = HashMap::new();
        let mut tracker = FirstOffsetTracker::new();
        let mut records = 0u64;
        let mut bytes = 0u64;
        let mut highest_channel_id = 0u32;

        let file_size = data.file().size()?;
        if file_size == 0 {
            // Nothing on disk; a stale index against an empty data file
            // names records that no longer exist, so drop it.
            index.reset()?;
            return Ok(Self {
                data,
                index,
                channels,
                tracker,
                records,
                bytes,
                highest_channel_id,
                closed: false,
            });
        }

        let data_name = data.file_ref().name().to_owned();
        let index_name = index.name().to_owned();

        if file_size < MAGIC_LEN {
            return Err(QmqError::BadMagic { file: data_name });
        }
        let mut magic = [0u8; DATA_FILE_MAGIC.len()];
        data.file_ref().pread_exact(&mut magic, 0)?;
        if &magic != DATA_FILE_MAGIC {
            return Err(QmqError::BadMagic { file: data_name });
        }

        index.read_entries(|name, stats, line| {
            let key = name.as_str();
            let parse_err = |detail: String| QmqError::IndexParse {
                file: index_name.clone(),
                line,
                detail,
            };
            if channels.contains_key(key) {
                return Err(parse_err(format!("duplicate channel '{key}'")));
            }
            if stats.records == 0 {
                // An empty channel cannot be restored: its id lives only in
                // record headers, and it has none.
                return Err(parse_err(format!("empty channel '{key}' in index")));
            }
            if stats.last_offset >= file_size {
                return Err(parse_err(format!(
                    "last offset {} beyond file size {file_size}",
                    stats.last_offset
                )));
            }

            let mut header_buf = [0u8; RecordHeader::SIZE];
            data.file_ref()
                .pread_exact(&mut header_buf, stats.first_offset)?;
            let first_header =
                RecordHeader::read(&header_buf, &data_name, stats.first_offset)?;
            if first_header.is_dummy() {
                return Err(QmqError::corrupt(
                    &data_name,
                    stats.first_offset,
                    format!("channel '{key}' starts at a dummy record"),
                ));
            }
            let id = first_header.channel_id;

            let last_header = if stats.last_offset == stats.first_offset {
                first_header
            } else {
                data.file_ref()
                    .pread_exact(&mut header_buf, stats.last_offset)?;
                RecordHeader::read(&header_buf, &data_name, stats.last_offset)?
            };
            if last_header.next_offset != 0 {
                return Err(QmqError::corrupt(
                    &data_name,
                    stats.last_offset,
                    format!("last record of '{key}' has a successor"),
                ));
            }
            if last_header.channel_id != id {
                return Err(QmqError::corrupt(
                    &data_name,
                    stats.last_offset,
                    format!(
                        "channel id mismatch along '{key}': first {id}, last {}",
                        last_header.channel_id
                    ),
                ));
            }

            let meta = ChannelMeta {
                id,
                stats,
                last_header,
            };
            meta.validate()
                .map_err(|detail| QmqError::recovery(format!("channel '{key}': {detail}")))?;

            tracker.insert(stats.first_offset, key)?;
            records += stats.records;
            bytes += stats.bytes;
            highest_channel_id = highest_channel_id.max(id);
            debug!(channel = key, id, records = stats.records, "recovered channel");
            channels.insert(key.to_owned(), meta);
            Ok(())
        })?;

        // Cross-channel uniqueness. First offsets were checked by the
        // tracker inserts; ids and last offsets still need it.
        let mut ids = HashSet::new();
        let mut last_offsets = HashSet::new();
        for (name, meta) in &channels {
            if !ids.insert(meta.id) {
                return Err(QmqError::recovery(format!(
                    "channel id {} of '{name}' is not unique",
                    meta.id
                )));
            }
            if !last_offsets.insert(meta.stats.last_offset) {
                return Err(QmqError::recovery(format!(
                    "last offset {} of '{name}' is not unique",
                    meta.stats.last_offset
                )));
            }
        }
        let needed = MAGIC_LEN + bytes + records * HEADER_LEN;
        if file_size < needed {
            return Err(QmqError::recovery(format!(
                "data file holds {file_size} bytes but the index accounts for {needed}"
            )));
        }

        let mut engine = Self {
            data,
            index,
            channels,
            tracker,
            records,
            bytes,
            highest_channel_id,
            closed: false,
        };
        if engine.records == 0 && file_size > 0 {
            // Stale index lost every channel; the data is unreachable.
            warn!(file_size, "data file has no indexed records, truncating");
            engine.truncate_files()?;
        }
        Ok(engine)
    }

    // -----------------------------------------------------------------
    // Channel registry
    // -----------------------------------------------------------------

    /// Look up a channel, allocating a fresh id and metadata entry if the
    /// name is new.
    pub fn get_or_create(&mut self, name: &str) -> Result<()> {
        if self.channels.contains_key(name) {
            return Ok(());
        }
        if self.highest_channel_id == u32::MAX {
            return Err(QmqError::ChannelIdExhausted);
        }
        self.highest_channel_id += 1;
        self.channels
            .insert(name.to_owned(), ChannelMeta::new(self.highest_channel_id));
        Ok(())
    }

    /// Whether a channel with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Names of all registered channels (empty ones included).
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Move a channel to a new name, preserving its metadata identity.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if self.channels.contains_key(new) {
            return Err(QmqError::invalid_name(new, "rename target already exists"));
        }
        let Some(meta) = self.channels.remove(old) else {
            return Err(QmqError::invalid_name(old, "unknown overflow channel"));
        };
        if meta.stats.records > 0 {
            self.tracker.rename(meta.stats.first_offset, new);
        }
        self.channels.insert(new.to_owned(), meta);
        Ok(())
    }

    /// Clear a channel and delete its registry entry.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.clear(name)?;
        self.channels.remove(name);
        if self.channels.is_empty() {
            self.highest_channel_id = 0;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Record operations
    // -----------------------------------------------------------------

    /// Append one record to a channel's chain.
    pub fn push(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        if !self.channels.contains_key(name) {
            return Err(QmqError::invalid_name(name, "unknown overflow channel"));
        }
        let mut pos = self.data.file().seek_end()?;
        if self.records == 0 {
            if pos != 0 {
                return Err(QmqError::corrupt(
                    self.data.file_ref().name(),
                    pos,
                    "data file not empty while the engine holds no records",
                ));
            }
            self.data.file().write(DATA_FILE_MAGIC)?;
            pos = MAGIC_LEN;
        }

        let meta = self.channels.get_mut(name).expect("checked above");
        let had_records = meta.stats.records > 0;
        if had_records {
            // Patch the previous tail so it points at the record we are
            // about to append.
            let mut prev = meta.last_header;
            prev.next_offset = i64::try_from(pos - meta.stats.last_offset)
                .expect("offset distance fits i64");
            prev.set_parity();
            self.data
                .file()
                .pwrite(&prev.to_bytes(), meta.stats.last_offset)?;
        }

        let header = RecordHeader::new(meta.id, payload.len());
        let header_bytes = header.to_bytes();
        if let Err(e) = self
            .data
            .file()
            .writev_all(&[header_bytes.as_slice(), payload])
        {
            if had_records {
                // The previous tail already points into the bytes this
                // writev failed to produce. There is no consistent state to
                // roll back to; continuing would corrupt the chain.
                error!(
                    channel = name,
                    error = %e,
                    "record append failed after linking the previous tail; aborting"
                );
                std::process::abort();
            }
            return Err(e);
        }

        if meta.stats.records == 0 {
            meta.stats.first_offset = pos;
            self.tracker.insert(pos, name)?;
        }
        meta.stats.last_offset = pos;
        meta.last_header = header;
        meta.stats.bytes += payload.len() as u64;
        meta.stats.records += 1;
        self.records += 1;
        self.bytes += payload.len() as u64;
        Ok(())
    }

    /// Pop the oldest record of a channel into `buf`.
    ///
    /// Returns `Ok(false)` when the channel is empty. `buf` is resized to
    /// the payload length.
    pub fn pop(&mut self, name: &str, buf: &mut Vec<u8>) -> Result<bool> {
        let data_name = self.data.file_ref().name().to_owned();
        let Some(meta) = self.channels.get_mut(name) else {
            return Err(QmqError::invalid_name(name, "unknown overflow channel"));
        };
        if meta.stats.records == 0 {
            return Ok(false);
        }

        let first = meta.stats.first_offset;
        let mut header_buf = [0u8; RecordHeader::SIZE];
        self.data.file_ref().pread_exact(&mut header_buf, first)?;
        let header = RecordHeader::read(&header_buf, &data_name, first)?;

        if header.channel_id != meta.id {
            return Err(QmqError::corrupt(
                &data_name,
                first,
                format!(
                    "record belongs to channel {} (expected {})",
                    header.channel_id, meta.id
                ),
            ));
        }
        if header.next_offset < 0
            || (header.next_offset != 0 && (header.next_offset as u64) < HEADER_LEN)
        {
            return Err(QmqError::corrupt(
                &data_name,
                first,
                format!("impossible next offset {}", header.next_offset),
            ));
        }
        let length = header.length as u64;
        if length > meta.stats.bytes {
            return Err(QmqError::corrupt(
                &data_name,
                first,
                format!(
                    "record length {length} exceeds the channel's {} remaining bytes",
                    meta.stats.bytes
                ),
            ));
        }
        let remaining = meta.stats.records - 1;
        if remaining == 0 {
            if header.next_offset != 0 {
                return Err(QmqError::corrupt(
                    &data_name,
                    first,
                    "tail record has a successor",
                ));
            }
            if meta.stats.bytes != length {
                return Err(QmqError::corrupt(
                    &data_name,
                    first,
                    format!(
                        "byte accounting residue: {} left after the last record",
                        meta.stats.bytes - length
                    ),
                ));
            }
        } else {
            if header.next_offset == 0 {
                return Err(QmqError::corrupt(
                    &data_name,
                    first,
                    format!("chain ends early with {remaining} records unaccounted"),
                ));
            }
            let next = first + header.next_offset as u64;
            if remaining == 1 && next != meta.stats.last_offset {
                return Err(QmqError::corrupt(
                    &data_name,
                    first,
                    format!(
                        "chain does not end at the recorded last offset {} (next {next})",
                        meta.stats.last_offset
                    ),
                ));
            }
        }

        buf.resize(header.length, 0);
        self.data.file_ref().pread_exact(buf, first + HEADER_LEN)?;

        meta.stats.records = remaining;
        meta.stats.bytes -= length;
        self.tracker.remove(first);
        if remaining == 0 {
            meta.reset();
        } else {
            let next = first + header.next_offset as u64;
            meta.stats.first_offset = next;
            self.tracker.insert(next, name)?;
        }
        self.records -= 1;
        self.bytes -= length;
        if self.records == 0 {
            self.truncate_files()?;
        }
        Ok(true)
    }

    /// Drop all records of a channel without reading them.
    ///
    /// Their payload bytes stay in the data file until the next
    /// head-truncation pass or the global empty-state truncation.
    pub fn clear(&mut self, name: &str) -> Result<()> {
        let Some(meta) = self.channels.get_mut(name) else {
            return Err(QmqError::invalid_name(name, "unknown overflow channel"));
        };
        if meta.stats.records > 0 {
            self.tracker.remove(meta.stats.first_offset);
        }
        self.records -= meta.stats.records;
        self.bytes -= meta.stats.bytes;
        meta.reset();
        if self.records == 0 {
            self.truncate_files()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------

    /// Reclaim the dead prefix of the data file, whole MiBs at a time.
    ///
    /// No-op when the filesystem lacks collapse-range or nothing is
    /// reclaimable. After the collapse the magic is rewritten and the
    /// sub-MiB remainder below the minimum live offset is covered by one
    /// zeroed dummy record (channel id 0), which no pop will ever accept.
    pub fn minimize(&mut self) -> Result<()> {
        if !self.data.head_truncation_supported() || self.tracker.is_empty() {
            return Ok(());
        }
        let (min_offset, _) = self.tracker.min().expect("tracker is non-empty");
        // Keep room for the magic plus one dummy header below the minimum.
        let reserve = MAGIC_LEN + HEADER_LEN;
        if min_offset <= reserve {
            return Ok(());
        }
        let removed = self.data.truncate_head(min_offset - reserve)?;
        if removed == 0 {
            return Ok(());
        }

        // Collapse-range does not adjust the implicit file position.
        self.data.file().seek_end()?;

        for (_, name) in self.tracker.iter() {
            let meta = self
                .channels
                .get_mut(name)
                .expect("tracked channel is registered");
            meta.stats.first_offset -= removed;
            meta.stats.last_offset -= removed;
        }
        self.tracker.shift_down(removed);

        self.data.file().pwrite(DATA_FILE_MAGIC, 0)?;
        let gap = (min_offset - removed) - reserve;
        let dummy = RecordHeader::new(0, usize::try_from(gap).expect("gap fits usize"));
        self.data.file().pwrite(&dummy.to_bytes(), MAGIC_LEN)?;
        self.data.zero_range(reserve, gap)?;
        debug!(removed, gap, "minimized data file head");
        Ok(())
    }

    /// Rewrite the index file from the current channel metadata.
    ///
    /// Empty channels are skipped: their ids exist only in memory and the
    /// format has nowhere to put them.
    pub fn write_index(&mut self) -> Result<()> {
        let mut entries: Vec<(&str, ChannelStats)> = self
            .channels
            .iter()
            .filter(|(_, meta)| meta.stats.records > 0)
            .map(|(name, meta)| (name.as_str(), meta.stats))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        self.index.write_entries(entries.into_iter())
    }

    /// The durability barrier: minimize, rewrite the index, `fdatasync`.
    pub fn flush(&mut self) -> Result<()> {
        self.minimize()?;
        self.write_index()?;
        self.data.file().datasync()
    }

    /// Shut the store down. Best effort: every file error is logged and
    /// swallowed so the remaining steps still run.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.records > 0 {
            if let Err(e) = self.write_index() {
                error!(error = %e, "index write during close failed");
            }
            if let Err(e) = self.data.file().close() {
                error!(error = %e, "data file close failed");
            }
            if let Err(e) = self.index.close() {
                error!(error = %e, "index file close failed");
            }
        } else {
            if let Err(e) = self.data.file().remove() {
                error!(error = %e, "data file unlink failed");
            }
            if let Err(e) = self.index.remove() {
                error!(error = %e, "index file unlink failed");
            }
        }
    }

    /// Whether `close` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // -----------------------------------------------------------------
    // Accounting
    // -----------------------------------------------------------------

    /// Records not yet popped, for one channel.
    #[must_use]
    pub fn num_records(&self, name: &str) -> u64 {
        self.channels
            .get(name)
            .map_or(0, |meta| meta.stats.records)
    }

    /// Payload bytes not yet popped, for one channel.
    #[must_use]
    pub fn num_bytes(&self, name: &str) -> u64 {
        self.channels.get(name).map_or(0, |meta| meta.stats.bytes)
    }

    /// Copy of a channel's stats.
    #[must_use]
    pub fn channel_stats(&self, name: &str) -> Option<ChannelStats> {
        self.channels.get(name).map(|meta| meta.stats)
    }

    /// Records across all channels.
    #[must_use]
    pub fn total_records(&self) -> u64 {
        self.records
    }

    /// Payload bytes across all channels.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    /// Current size of the data file.
    pub fn data_file_size(&self) -> Result<u64> {
        self.data.file_ref().size()
    }

    /// Whether the head-truncation pass can do anything on this filesystem.
    #[must_use]
    pub fn head_truncation_supported(&self) -> bool {
        self.data.head_truncation_supported()
    }

    fn truncate_files(&mut self) -> Result<()> {
        debug_assert_eq!(self.records, 0);
        debug_assert_eq!(self.bytes, 0);
        self.data.file().reset()?;
        self.index.reset()
    }
}
