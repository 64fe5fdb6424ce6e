//! Channel lookup, creation, and the startup scan of the data directory.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use qmq_error::{QmqError, Result};
use qmq_overflow::handle::SharedEngine;
use qmq_overflow::{OverflowEngine, OverflowHandle};
use qmq_types::{StorageName, DATA_FILE_NAME, DUMP_FILE_SUFFIX, INDEX_FILE_NAME};
use tracing::{debug, error, warn};

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::ring::MemoryRing;
use crate::storage::Storage;

/// Resources shared by every channel: the overflow engine, the storage
/// pool, and the memory budget. Channels hold this through `Rc`, matching
/// the single-threaded cooperative model.
pub struct NodeResources {
    engine: SharedEngine,
    pool: RefCell<Vec<Storage>>,
    ring_bytes_in_use: Cell<u64>,
    budget: Option<u64>,
}

impl NodeResources {
    fn new(engine: SharedEngine, budget: Option<u64>) -> Self {
        Self {
            engine,
            pool: RefCell::new(Vec::new()),
            ring_bytes_in_use: Cell::new(0),
            budget,
        }
    }

    /// The shared overflow engine.
    #[must_use]
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// Build a storage for `name`, reviving a pooled one when available.
    pub(crate) fn build_storage(&self, name: StorageName, capacity: usize) -> Result<Storage> {
        let requested = capacity as u64;
        let in_use = self.ring_bytes_in_use.get();
        if let Some(budget) = self.budget {
            if in_use + requested > budget {
                return Err(QmqError::BudgetExhausted {
                    in_use,
                    requested,
                    budget,
                });
            }
        }
        let pooled = self.pool.borrow_mut().pop();
        let storage = match pooled {
            Some(mut storage) => {
                if storage.ring_capacity() == capacity {
                    storage.ring_mut().clear();
                } else {
                    *storage.ring_mut() = MemoryRing::new(capacity);
                }
                storage.overflow_mut().readd(name.clone())?;
                storage.rebind(name);
                storage
            }
            None => {
                let overflow = OverflowHandle::attach(Rc::clone(&self.engine), name.clone())?;
                Storage::new(name, MemoryRing::new(capacity), overflow)
            }
        };
        self.ring_bytes_in_use.set(in_use + requested);
        Ok(storage)
    }

    /// Return a storage to the pool, detaching its overflow channel.
    /// Pooled rings do not count against the memory budget.
    pub(crate) fn recycle(&self, mut storage: Storage) {
        self.ring_bytes_in_use
            .set(self.ring_bytes_in_use.get() - storage.ring_capacity() as u64);
        if let Err(e) = storage.overflow_mut().remove() {
            error!(
                storage = storage.name().as_str(),
                error = %e,
                "overflow detach during recycle failed"
            );
        }
        storage.consumers_mut().clear();
        storage.ring_mut().clear();
        self.pool.borrow_mut().push(storage);
    }

    /// Summed capacities of live rings, for budget introspection.
    #[must_use]
    pub fn ring_bytes_in_use(&self) -> u64 {
        self.ring_bytes_in_use.get()
    }
}

impl std::fmt::Debug for NodeResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeResources")
            .field("pooled", &self.pool.borrow().len())
            .field("ring_bytes_in_use", &self.ring_bytes_in_use.get())
            .field("budget", &self.budget)
            .finish()
    }
}

/// Owns every channel of one data directory.
#[derive(Debug)]
pub struct ChannelRegistry {
    dir: PathBuf,
    config: ChannelConfig,
    resources: Rc<NodeResources>,
    channels: HashMap<String, Channel>,
    shutting_down: bool,
}

impl ChannelRegistry {
    /// Open the registry: recover the overflow store, then scan the data
    /// directory for ring dumps and overflow-only storages.
    pub fn open(dir: &Path, config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let engine: SharedEngine = Rc::new(RefCell::new(OverflowEngine::open(dir)?));
        let resources = Rc::new(NodeResources::new(engine, config.memory_budget));
        let mut registry = Self {
            dir: dir.to_path_buf(),
            config,
            resources,
            channels: HashMap::new(),
            shutting_down: false,
        };
        registry.scan_data_directory()?;
        Ok(registry)
    }

    /// Look up a channel, creating it if absent. Refused during shutdown.
    pub fn get_create(&mut self, channel: &str) -> Result<&mut Channel> {
        if self.shutting_down {
            return Err(QmqError::ShuttingDown);
        }
        self.ensure_channel(channel)
    }

    fn ensure_channel(&mut self, channel: &str) -> Result<&mut Channel> {
        let parsed = StorageName::parse(channel)?;
        if parsed.is_subscriber() {
            return Err(QmqError::invalid_name(
                channel,
                "channel names may not contain '@'",
            ));
        }
        if !self.channels.contains_key(channel) {
            let capacity = self.config.capacity_for(channel);
            self.channels.insert(
                channel.to_owned(),
                Channel::new(channel, capacity, Rc::clone(&self.resources)),
            );
        }
        Ok(self
            .channels
            .get_mut(channel)
            .expect("inserted or present above"))
    }

    /// Remove a channel: reset every storage (consumers get `Finish`),
    /// recycle them, and drop the registry entry. Unknown names are a
    /// no-op.
    pub fn remove(&mut self, channel: &str) -> Result<()> {
        let Some(mut entry) = self.channels.remove(channel) else {
            return Ok(());
        };
        entry.reset()
    }

    /// Iterate all channels.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Iterate all channel names.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Look up an existing channel without creating it.
    pub fn get(&mut self, channel: &str) -> Option<&mut Channel> {
        self.channels.get_mut(channel)
    }

    /// The durability barrier: flush the overflow store, then announce the
    /// flush on every storage.
    pub fn flush(&mut self) -> Result<()> {
        self.resources.engine.borrow_mut().flush()?;
        for channel in self.channels.values_mut() {
            channel.flush();
        }
        Ok(())
    }

    /// Rewrite only the index file.
    pub fn write_index(&mut self) -> Result<()> {
        self.resources.engine.borrow_mut().write_index()
    }

    /// Shut down: dump every memory ring, then close the overflow store.
    /// Best effort throughout; afterwards `get_create` is refused.
    pub fn close(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        for channel in self.channels.values_mut() {
            channel.close(&self.dir);
        }
        self.resources.engine.borrow_mut().close();
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Directory this registry operates in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shared node resources (engine access for stats and tests).
    #[must_use]
    pub fn resources(&self) -> &Rc<NodeResources> {
        &self.resources
    }

    // -----------------------------------------------------------------
    // Startup scan
    // -----------------------------------------------------------------

    fn scan_data_directory(&mut self) -> Result<()> {
        let dir_name = self.dir.display().to_string();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| QmqError::io(dir_name.clone(), "readdir", e))?;

        // Pass 1: collect and load the ring dump files.
        let mut dumps: Vec<(StorageName, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QmqError::io(dir_name.clone(), "readdir", e))?;
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .map_err(|e| QmqError::io(dir_name.clone(), "stat", e))?
                .is_dir();
            if is_dir {
                warn!(path = %path.display(), "ignoring subdirectory in data directory");
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                warn!(path = %path.display(), "ignoring non-UTF-8 file name");
                continue;
            };
            if file_name == DATA_FILE_NAME || file_name == INDEX_FILE_NAME {
                continue;
            }
            match file_name.strip_suffix(DUMP_FILE_SUFFIX) {
                Some(stem) => {
                    let name = StorageName::parse(stem).map_err(|e| {
                        QmqError::recovery(format!("invalid ring dump file '{file_name}': {e}"))
                    })?;
                    dumps.push((name, path));
                }
                None => {
                    warn!(file = file_name, "ignoring unrecognized file in data directory");
                }
            }
        }
        dumps.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        for (name, path) in &dumps {
            let bytes = std::fs::read(path)
                .map_err(|e| QmqError::io(path.display().to_string(), "read", e))?;
            let channel = self.ensure_channel(name.channel())?;
            let storage = channel.add_startup_storage(name)?.ok_or_else(|| {
                QmqError::recovery(format!("duplicate storage '{name}' in startup scan"))
            })?;
            storage.load_dump(&bytes)?;
            debug!(storage = name.as_str(), "loaded ring dump");
        }

        // Pass 2: storages that only exist in the overflow store.
        let overflow_names: Vec<String> = self
            .resources
            .engine
            .borrow()
            .channel_names()
            .map(str::to_owned)
            .collect();
        for raw in overflow_names {
            let name = StorageName::parse(raw)?;
            let channel = self.ensure_channel(name.channel())?;
            if channel.add_startup_storage(&name)?.is_some() {
                debug!(storage = name.as_str(), "adopted overflow-only storage");
            }
        }

        // Pass 3: loaded dumps are deleted; the next shutdown rewrites them.
        for (_, path) in &dumps {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "could not delete ring dump");
            }
        }
        Ok(())
    }
}
