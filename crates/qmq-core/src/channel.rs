//! A channel and its storages.
//!
//! A channel is in one of three states, derived from its storages:
//! *reset* (none), *anonymous* (one storage named like the channel), or
//! *subscribed* (one storage per subscriber, each named
//! `subscriber@channel`). The only in-place identity change in the system
//! is the promotion of the anonymous storage into the first subscriber's
//! storage: a rename, never a copy.

use std::rc::Rc;

use qmq_error::{QmqError, Result};
use qmq_types::StorageName;
use tracing::error;

use crate::registry::NodeResources;
use crate::storage::Storage;

/// One named channel, fanning pushes out to its storages.
#[derive(Debug)]
pub struct Channel {
    name: String,
    ring_capacity: usize,
    resources: Rc<NodeResources>,
    storages: Vec<Storage>,
    subscribed: bool,
}

impl Channel {
    pub(crate) fn new(name: &str, ring_capacity: usize, resources: Rc<NodeResources>) -> Self {
        Self {
            name: name.to_owned(),
            ring_capacity,
            resources,
            storages: Vec::new(),
            subscribed: false,
        }
    }

    /// The channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the channel has subscriber storages.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscribed
    }

    /// Whether the channel holds no storage at all.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.storages.is_empty()
    }

    fn new_storage(&self, storage_name: StorageName) -> Result<Storage> {
        self.resources.build_storage(storage_name, self.ring_capacity)
    }

    fn position_of_subscriber(&self, subscriber: &str) -> Option<usize> {
        self.storages
            .iter()
            .position(|storage| storage.name().subscriber() == Some(subscriber))
    }

    /// Buffer one record into every storage of the channel.
    ///
    /// A reset channel grows its anonymous storage on the first push.
    pub fn push(&mut self, payload: &[u8]) -> Result<()> {
        if self.storages.is_empty() {
            let name = StorageName::parse(self.name.as_str())?;
            let storage = self.new_storage(name)?;
            self.storages.push(storage);
            self.subscribed = false;
        }
        for storage in &mut self.storages {
            storage.push(payload)?;
        }
        Ok(())
    }

    /// Pop the oldest record of the anonymous storage into `buf`.
    ///
    /// A subscribed channel has no single pop position; use the subscriber
    /// storages instead.
    pub fn pop(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        if self.subscribed {
            return Err(QmqError::HasSubscribers {
                channel: self.name.clone(),
            });
        }
        match self.storages.first_mut() {
            Some(storage) => storage.pop(buf),
            None => Ok(false),
        }
    }

    /// Get or create the storage of `subscriber`.
    ///
    /// On an anonymous channel the existing storage is renamed to
    /// `subscriber@channel` and becomes this subscriber's; its buffered
    /// records do not move. Later subscribers start empty.
    pub fn subscribe(&mut self, subscriber: &str) -> Result<&mut Storage> {
        let storage_name = StorageName::subscriber_storage(subscriber, &self.name)?;
        if self.subscribed {
            if let Some(index) = self.position_of_subscriber(subscriber) {
                return Ok(&mut self.storages[index]);
            }
            let storage = self.new_storage(storage_name)?;
            self.storages.push(storage);
            return Ok(self.storages.last_mut().expect("just pushed"));
        }
        if !self.storages.is_empty() {
            let anonymous = self.storages.first_mut().expect("anonymous storage");
            anonymous.rename(storage_name)?;
            self.subscribed = true;
            return Ok(anonymous);
        }
        let storage = self.new_storage(storage_name)?;
        self.subscribed = true;
        self.storages.push(storage);
        Ok(self.storages.last_mut().expect("just pushed"))
    }

    /// The anonymous storage, if and only if there are no subscribers.
    pub fn storage_unless_subscribed(&mut self) -> Option<&mut Storage> {
        if self.subscribed {
            None
        } else {
            self.storages.first_mut()
        }
    }

    /// The storage of an existing subscriber.
    pub fn subscriber_storage(&mut self, subscriber: &str) -> Option<&mut Storage> {
        if !self.subscribed {
            return None;
        }
        let index = self.position_of_subscriber(subscriber)?;
        Some(&mut self.storages[index])
    }

    /// Install a storage during the startup scan.
    ///
    /// Returns None when the storage already exists. A channel may never
    /// mix an anonymous storage with subscriber storages; on-disk state
    /// claiming otherwise is unrecoverable.
    pub(crate) fn add_startup_storage(
        &mut self,
        name: &StorageName,
    ) -> Result<Option<&mut Storage>> {
        debug_assert_eq!(name.channel(), self.name);
        if name.is_subscriber() {
            if !self.storages.is_empty() && !self.subscribed {
                return Err(QmqError::recovery(format!(
                    "channel '{}' has both an anonymous storage and subscriber storage '{name}'",
                    self.name
                )));
            }
            let subscriber = name.subscriber().expect("subscriber storage");
            if self.position_of_subscriber(subscriber).is_some() {
                return Ok(None);
            }
            let storage = self.new_storage(name.clone())?;
            self.subscribed = true;
            self.storages.push(storage);
        } else {
            if self.subscribed {
                return Err(QmqError::recovery(format!(
                    "channel '{}' has subscribers but anonymous storage '{name}' exists on disk",
                    self.name
                )));
            }
            if !self.storages.is_empty() {
                return Ok(None);
            }
            let storage = self.new_storage(name.clone())?;
            self.storages.push(storage);
        }
        Ok(Some(self.storages.last_mut().expect("just pushed")))
    }

    /// Iterate the channel's storages.
    pub fn storages(&self) -> impl Iterator<Item = &Storage> {
        self.storages.iter()
    }

    /// Iterate the channel's storages mutably.
    pub fn storages_mut(&mut self) -> impl Iterator<Item = &mut Storage> {
        self.storages.iter_mut()
    }

    /// Records buffered across all storages.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.storages.iter().map(Storage::num_records).sum()
    }

    /// Payload bytes buffered across all storages.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.storages.iter().map(Storage::num_bytes).sum()
    }

    /// Drop all buffered records in every storage.
    pub fn clear(&mut self) -> Result<()> {
        for storage in &mut self.storages {
            storage.clear()?;
        }
        Ok(())
    }

    /// Announce a node flush on every storage.
    pub fn flush(&mut self) {
        for storage in &mut self.storages {
            storage.flush();
        }
    }

    /// Tear the channel back to the reset state: every storage is cleared,
    /// its consumers receive `Finish`, and the storage goes to the pool.
    pub fn reset(&mut self) -> Result<()> {
        let resources = Rc::clone(&self.resources);
        let mut first_error = None;
        for mut storage in self.storages.drain(..) {
            if let Err(e) = storage.reset() {
                first_error.get_or_insert(e);
            }
            resources.recycle(storage);
        }
        self.subscribed = false;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write every storage's ring dump; failures are logged and swallowed
    /// so the remaining storages still get their dumps.
    pub(crate) fn close(&mut self, dir: &std::path::Path) {
        for storage in &mut self.storages {
            if let Err(e) = storage.close(dir) {
                error!(
                    storage = storage.name().as_str(),
                    error = %e,
                    "ring dump write failed during close"
                );
            }
        }
    }
}
