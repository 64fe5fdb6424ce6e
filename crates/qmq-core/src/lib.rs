//! QuiverMQ storage engine.
//!
//! Two-tier persistent message queueing for a single node: every storage
//! (a channel, or one subscriber of a channel) buffers records in a bounded
//! in-memory ring and spills into the shared disk overflow store when the
//! ring fills. Memory rings persist across restarts through per-storage
//! dump files written at shutdown; the overflow persists through its own
//! data and index files.
//!
//! The whole engine is single-threaded cooperative: public calls run to
//! completion, consumer callbacks fire synchronously inside the triggering
//! operation, and file I/O blocks the caller.
//!
//! ```no_run
//! use qmq_core::{ChannelConfig, QueueNode};
//!
//! # fn main() -> qmq_error::Result<()> {
//! let mut node = QueueNode::open(std::path::Path::new("/var/lib/quivermq"),
//!     ChannelConfig::default())?;
//! node.get_channel("orders")?.push(b"hello")?;
//! let mut buf = Vec::new();
//! assert!(node.get_channel("orders")?.pop(&mut buf)?);
//! node.flush()?;
//! node.close();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod consumer;
pub mod registry;
pub mod ring;
pub mod storage;

pub use channel::Channel;
pub use config::{ChannelConfig, PrefixCapacity};
pub use consumer::{Consumer, ConsumerEvent};
pub use registry::ChannelRegistry;
pub use ring::MemoryRing;
pub use storage::Storage;

use std::path::Path;

use qmq_error::Result;

/// The node-level facade over the channel registry.
///
/// Dropping the node performs a best-effort close if the embedder forgot,
/// so ring dumps and the index survive unclean shutdown paths.
#[derive(Debug)]
pub struct QueueNode {
    registry: ChannelRegistry,
}

impl QueueNode {
    /// Open (or recover) the node state in `dir`.
    pub fn open(dir: &Path, config: ChannelConfig) -> Result<Self> {
        Ok(Self {
            registry: ChannelRegistry::open(dir, config)?,
        })
    }

    /// Look up a channel, creating it if absent.
    pub fn get_channel(&mut self, name: &str) -> Result<&mut Channel> {
        self.registry.get_create(name)
    }

    /// Remove a channel; its consumers receive `Finish`.
    pub fn remove_channel(&mut self, name: &str) -> Result<()> {
        self.registry.remove(name)
    }

    /// The durability barrier: minimize the data file, rewrite the index,
    /// `fdatasync`, and announce the flush to every consumer.
    pub fn flush(&mut self) -> Result<()> {
        self.registry.flush()
    }

    /// Rewrite only the index file.
    pub fn write_index(&mut self) -> Result<()> {
        self.registry.write_index()
    }

    /// Shut down: dump memory rings, close the overflow store. Best
    /// effort; afterwards channel creation is refused.
    pub fn close(&mut self) {
        self.registry.close();
    }

    /// Visit every channel name.
    pub fn iterate_channel_names(&self, f: &mut dyn FnMut(&str)) {
        for name in self.registry.channel_names() {
            f(name);
        }
    }

    /// Records buffered across the whole node.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.registry.channels().map(Channel::num_records).sum()
    }

    /// Payload bytes buffered across the whole node.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.registry.channels().map(Channel::num_bytes).sum()
    }

    /// The underlying registry, for embedders needing finer control.
    #[must_use]
    pub fn registry(&mut self) -> &mut ChannelRegistry {
        &mut self.registry
    }
}

impl Drop for QueueNode {
    fn drop(&mut self) {
        self.registry.close();
    }
}
