//! Per-storage handle onto the shared overflow engine.
//!
//! The engine's metadata entries live in an arena keyed by storage name, so
//! the handle addresses its channel by name and shares the engine through
//! `Rc<RefCell<…>>` (the node is single-threaded cooperative; no lock is
//! needed or wanted). A rename updates the stored name, preserving the
//! metadata's identity inside the engine.

use std::cell::RefCell;
use std::rc::Rc;

use qmq_error::{QmqError, Result};
use qmq_types::{RecordHeader, StorageName};

use crate::engine::OverflowEngine;

/// Shared ownership of the overflow engine.
pub type SharedEngine = Rc<RefCell<OverflowEngine>>;

/// A movable handle bound to one overflow channel.
#[derive(Debug)]
pub struct OverflowHandle {
    engine: SharedEngine,
    /// None after `remove` detached the handle.
    name: Option<StorageName>,
}

impl OverflowHandle {
    /// Attach to (creating if needed) the engine channel for `name`.
    pub fn attach(engine: SharedEngine, name: StorageName) -> Result<Self> {
        engine.borrow_mut().get_or_create(name.as_str())?;
        Ok(Self {
            engine,
            name: Some(name),
        })
    }

    fn bound_name(&self) -> Result<&StorageName> {
        self.name
            .as_ref()
            .ok_or_else(|| QmqError::invalid_name("", "overflow handle is detached"))
    }

    /// The storage name this handle is bound to, if attached.
    #[must_use]
    pub fn name(&self) -> Option<&StorageName> {
        self.name.as_ref()
    }

    /// Append one record.
    pub fn push(&self, payload: &[u8]) -> Result<()> {
        let name = self.bound_name()?;
        self.engine.borrow_mut().push(name.as_str(), payload)
    }

    /// Pop the oldest record into `buf`; false when empty.
    pub fn pop(&self, buf: &mut Vec<u8>) -> Result<bool> {
        let name = self.bound_name()?;
        self.engine.borrow_mut().pop(name.as_str(), buf)
    }

    /// Drop all buffered records.
    pub fn clear(&self) -> Result<()> {
        let name = self.bound_name()?;
        self.engine.borrow_mut().clear(name.as_str())
    }

    /// Rename the bound channel, keeping its records.
    pub fn rename(&mut self, new_name: StorageName) -> Result<()> {
        let old = self.bound_name()?.clone();
        self.engine
            .borrow_mut()
            .rename(old.as_str(), new_name.as_str())?;
        self.name = Some(new_name);
        Ok(())
    }

    /// Records not yet popped.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.name
            .as_ref()
            .map_or(0, |name| self.engine.borrow().num_records(name.as_str()))
    }

    /// Payload bytes not yet popped.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.name
            .as_ref()
            .map_or(0, |name| self.engine.borrow().num_bytes(name.as_str()))
    }

    /// On-disk footprint: payload bytes plus one header per record.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.num_bytes() + self.num_records() * RecordHeader::SIZE as u64
    }

    /// Remove the channel from the engine and detach this handle.
    pub fn remove(&mut self) -> Result<()> {
        let name = self.bound_name()?.clone();
        self.engine.borrow_mut().remove(name.as_str())?;
        self.name = None;
        Ok(())
    }

    /// Reattach a detached handle to an engine channel.
    pub fn readd(&mut self, name: StorageName) -> Result<()> {
        if self.name.is_some() {
            return Err(QmqError::invalid_name(
                name.as_str(),
                "overflow handle is already attached",
            ));
        }
        self.engine.borrow_mut().get_or_create(name.as_str())?;
        self.name = Some(name);
        Ok(())
    }

    /// The shared engine, for registry-level operations.
    #[must_use]
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }
}
