//! One storage: the memory ring and overflow handle behind a single
//! (channel, subscriber) pair, plus its registered consumers.

use std::path::Path;
use std::rc::Rc;

use qmq_error::Result;
use qmq_types::{StorageName, DUMP_FILE_SUFFIX};
use qmq_vfs::PosixFile;
use tracing::debug;

use crate::consumer::{Consumer, ConsumerEvent, ConsumerRegistry};
use crate::ring::MemoryRing;
use qmq_overflow::OverflowHandle;

/// Memory tier + overflow tier for one storage, with consumer signaling.
#[derive(Debug)]
pub struct Storage {
    name: StorageName,
    ring: MemoryRing,
    overflow: OverflowHandle,
    consumers: ConsumerRegistry,
}

impl Storage {
    /// Assemble a storage from its parts.
    #[must_use]
    pub fn new(name: StorageName, ring: MemoryRing, overflow: OverflowHandle) -> Self {
        Self {
            name,
            ring,
            overflow,
            consumers: ConsumerRegistry::new(),
        }
    }

    /// The storage name (`channel` or `subscriber@channel`).
    #[must_use]
    pub fn name(&self) -> &StorageName {
        &self.name
    }

    /// The human-facing id: the name with a leading `@` stripped.
    #[must_use]
    pub fn display_id(&self) -> &str {
        self.name.display_id()
    }

    /// Buffer one record and wake one consumer.
    ///
    /// Records already spilled to the overflow are older than anything the
    /// ring could accept now, so while the overflow holds records for this
    /// storage every new record follows them there; otherwise the ring is
    /// tried first and the overflow absorbs what does not fit.
    pub fn push(&mut self, payload: &[u8]) -> Result<()> {
        if self.overflow.num_records() > 0 || !self.ring.push(payload) {
            self.overflow.push(payload)?;
        }
        self.consumers.notify_one(ConsumerEvent::DataReady);
        Ok(())
    }

    /// Pop the oldest record into `buf`; false when both tiers are empty.
    pub fn pop(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        if self.ring.pop_into(buf) {
            return Ok(true);
        }
        self.overflow.pop(buf)
    }

    /// Records buffered across both tiers.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.ring.len() as u64 + self.overflow.num_records()
    }

    /// Payload bytes buffered across both tiers.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.ring.payload_bytes() as u64 + self.overflow.num_bytes()
    }

    /// Drop all buffered records in both tiers.
    pub fn clear(&mut self) -> Result<()> {
        self.ring.clear();
        self.overflow.clear()
    }

    /// Announce a node flush to every consumer.
    pub fn flush(&mut self) {
        self.consumers.broadcast(ConsumerEvent::Flush);
    }

    /// Clear both tiers and tell every consumer the storage is going away.
    pub fn reset(&mut self) -> Result<()> {
        self.clear()?;
        self.consumers.broadcast(ConsumerEvent::Finish);
        Ok(())
    }

    /// Persist the memory ring to `<name>.rq` in `dir` (or remove a stale
    /// dump when the ring is empty). The overflow tier persists through the
    /// engine's own close.
    pub fn close(&mut self, dir: &Path) -> Result<()> {
        let file_name = format!("{}{DUMP_FILE_SUFFIX}", self.name.as_str());
        if self.ring.is_empty() {
            match std::fs::remove_file(dir.join(&file_name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(qmq_error::QmqError::io(file_name, "unlink", e)),
            }
            return Ok(());
        }
        let dump = self.ring.save();
        let mut file = PosixFile::open(dir, &file_name)?;
        file.reset()?;
        file.write(&dump)?;
        file.close()?;
        debug!(
            storage = self.name.as_str(),
            records = self.ring.len(),
            "wrote ring dump"
        );
        Ok(())
    }

    /// Restore the memory ring from a dump file's bytes.
    pub fn load_dump(&mut self, bytes: &[u8]) -> Result<()> {
        self.ring.load(bytes)
    }

    /// Rename the storage (used by the anonymous-to-subscriber promotion).
    /// No record moves in either tier.
    pub fn rename(&mut self, new_name: StorageName) -> Result<()> {
        self.overflow.rename(new_name.clone())?;
        self.name = new_name;
        Ok(())
    }

    /// Register a consumer; it joins the round-robin rotation.
    pub fn register_consumer(&mut self, consumer: Rc<dyn Consumer>) {
        self.consumers.register(consumer);
    }

    /// Unregister a consumer by identity.
    pub fn unregister_consumer(&mut self, consumer: &Rc<dyn Consumer>) -> bool {
        self.consumers.unregister(consumer)
    }

    /// Number of registered consumers.
    #[must_use]
    pub fn num_consumers(&self) -> usize {
        self.consumers.len()
    }

    /// Ring capacity in bytes, used by the pool when reviving storages.
    #[must_use]
    pub fn ring_capacity(&self) -> usize {
        self.ring.total_space()
    }

    pub(crate) fn ring_mut(&mut self) -> &mut MemoryRing {
        &mut self.ring
    }

    /// Point a pooled storage at a new name after its overflow handle was
    /// reattached.
    pub(crate) fn rebind(&mut self, name: StorageName) {
        self.name = name;
    }

    pub(crate) fn overflow_mut(&mut self) -> &mut OverflowHandle {
        &mut self.overflow
    }

    pub(crate) fn consumers_mut(&mut self) -> &mut ConsumerRegistry {
        &mut self.consumers
    }
}
