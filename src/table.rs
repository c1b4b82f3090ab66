use crate::capability;
use crate::engine::{Handle, SharedEngine};
use crate::error::{ConsoleError, Result};
use crate::port::PortConfiguration;
use log::debug;
use std::collections::BTreeMap;
use thiserror::Error;

/// A placement the table refused, with the configuration handed back unreleased.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PlaceError {
    pub error: ConsoleError,
    pub config: PortConfiguration,
}

impl From<PlaceError> for ConsoleError {
    fn from(rejected: PlaceError) -> Self { rejected.error }
}

/// Sparse, index-addressed port slots of one console device configuration.
///
/// The table owns every placed [`PortConfiguration`], so an entry stays alive
/// for as long as the table does even when nothing else refers to it.
pub struct PortTable {
    engine: SharedEngine,
    device: Handle,
    entries: BTreeMap<u32, PortConfiguration>,
}

impl PortTable {
    pub(crate) fn new(engine: SharedEngine, device: Handle) -> Self {
        Self { engine, device, entries: BTreeMap::new() }
    }

    /// Maximum number of ports the engine declares for this device.
    ///
    /// Independent of how many slots are occupied, and authoritative over the
    /// highest occupied index.
    pub fn capacity(&self) -> Result<u32> {
        capability::require(self.engine.as_ref())?;
        self.engine.configured_port_capacity(self.device)
    }

    pub(crate) fn set_capacity(&mut self, capacity: u32) -> Result<()> {
        capability::require(self.engine.as_ref())?;
        if let Some((&index, _)) = self.entries.range(capacity..).next() {
            return Err(ConsoleError::IndexOutOfRange { index, capacity });
        }
        self.engine.set_configured_port_capacity(self.device, capacity)
    }

    /// Places `config` at `index`, returning the entry it replaced.
    ///
    /// Fails with [`ConsoleError::IndexOutOfRange`] when `index >= capacity()`.
    /// On any error the table is unchanged and `config` comes back inside the
    /// [`PlaceError`].
    pub fn place(
        &mut self,
        index: u32,
        config: PortConfiguration,
    ) -> std::result::Result<Option<PortConfiguration>, PlaceError> {
        let capacity = match self.capacity() {
            Ok(capacity) => capacity,
            Err(error) => return Err(PlaceError { error, config }),
        };
        if index >= capacity {
            return Err(PlaceError { error: ConsoleError::IndexOutOfRange { index, capacity }, config });
        }
        if let Err(error) = self.engine.set_configured_port(self.device, index, Some(config.handle())) {
            return Err(PlaceError { error, config });
        }
        debug!("device {}: placed port {} at index {}", self.device, config.handle(), index);
        Ok(self.entries.insert(index, config))
    }

    /// Empties the slot at `index` and hands its entry back.
    pub fn take(&mut self, index: u32) -> Result<Option<PortConfiguration>> {
        capability::require(self.engine.as_ref())?;
        if !self.entries.contains_key(&index) {
            return Ok(None);
        }
        self.engine.set_configured_port(self.device, index, None)?;
        debug!("device {}: cleared index {}", self.device, index);
        Ok(self.entries.remove(&index))
    }

    pub fn get(&self, index: u32) -> Option<&PortConfiguration> { self.entries.get(&index) }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut PortConfiguration> { self.entries.get_mut(&index) }

    pub fn contains(&self, index: u32) -> bool { self.entries.contains_key(&index) }

    /// Occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &PortConfiguration)> {
        self.entries.iter().map(|(i, p)| (*i, p))
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
