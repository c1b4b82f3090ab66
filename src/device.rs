use crate::capability;
use crate::engine::{Handle, SharedEngine};
use crate::error::Result;
use crate::port::PortConfiguration;
use crate::table::{PlaceError, PortTable};

/// Virtio console device with multiple ports, as configured before boot.
///
/// Validation of the whole machine configuration (for example requiring at
/// least one console device) is left to the machine-level configuration.
pub struct DeviceConfiguration {
    engine: SharedEngine,
    handle: Handle,
    ports: PortTable,
}

impl DeviceConfiguration {
    pub fn new(engine: SharedEngine) -> Result<Self> {
        capability::require(engine.as_ref())?;
        let handle = engine.new_device_configuration()?;
        let ports = PortTable::new(engine.clone(), handle);
        Ok(Self { engine, handle, ports })
    }

    pub fn handle(&self) -> Handle { self.handle }

    /// Maximum number of ports allocated by this device.
    pub fn maximum_port_count(&self) -> Result<u32> { self.ports.capacity() }

    /// Declares a new port capacity; fails if an occupied index would fall outside it.
    pub fn set_maximum_port_count(&mut self, count: u32) -> Result<()> { self.ports.set_capacity(count) }

    pub fn ports(&self) -> &PortTable { &self.ports }

    pub fn ports_mut(&mut self) -> &mut PortTable { &mut self.ports }

    /// Places `config` at `index`; see [`PortTable::place`].
    pub fn place_port(
        &mut self,
        index: u32,
        config: PortConfiguration,
    ) -> std::result::Result<Option<PortConfiguration>, PlaceError> {
        self.ports.place(index, config)
    }
}

impl std::fmt::Debug for DeviceConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfiguration")
            .field("handle", &self.handle)
            .field("ports", &self.ports.iter().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for DeviceConfiguration {
    fn drop(&mut self) {
        self.engine.release(self.handle);
    }
}
