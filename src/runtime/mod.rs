//! Runtime view of console devices after the machine has started.
//!
//! Discovery is only meaningful once the machine has signalled that its
//! runtime devices exist. Nothing here adds or removes ports; only
//! attachments can be rebound.

mod port;

pub use port::RuntimePort;

use crate::capability;
use crate::engine::{Handle, PortEventKind, SharedEngine};
use crate::error::Result;
use log::debug;
use once_cell::sync::OnceCell;
use std::collections::HashMap;

/// Engine class of a multi-port virtio console device.
pub const CONSOLE_DEVICE_CLASS: &str = "VirtioConsoleDevice";

/// Console devices of a running machine, in the order the engine reports them.
pub fn discover(engine: &SharedEngine, machine: Handle) -> Result<Vec<RuntimeDevice>> {
    capability::require(engine.as_ref())?;
    let handles = engine.runtime_devices(machine)?;
    let mut devices = Vec::with_capacity(handles.len());
    for handle in handles {
        let class_name = engine.device_class(handle)?;
        let device = if class_name == CONSOLE_DEVICE_CLASS {
            RuntimeDevice::Console(ConsoleDevice::new(engine.clone(), handle))
        } else {
            debug!("machine {}: device {} of class {} left unclassified", machine, handle, class_name);
            RuntimeDevice::Unclassified(UnclassifiedDevice { handle, class_name })
        };
        devices.push(device);
    }
    Ok(devices)
}

#[derive(Debug)]
pub enum RuntimeDevice {
    Console(ConsoleDevice),
    Unclassified(UnclassifiedDevice),
}

impl RuntimeDevice {
    pub fn handle(&self) -> Handle {
        match self {
            RuntimeDevice::Console(d) => d.handle,
            RuntimeDevice::Unclassified(d) => d.handle,
        }
    }

    pub fn as_console(&self) -> Option<&ConsoleDevice> {
        match self {
            RuntimeDevice::Console(d) => Some(d),
            RuntimeDevice::Unclassified(_) => None,
        }
    }
}

/// A runtime device of a kind this crate does not model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclassifiedDevice {
    pub handle: Handle,
    pub class_name: String,
}

/// Guest opened or closed a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Opened { index: u32 },
    Closed { index: u32 },
}

/// A running multi-port virtio console device.
pub struct ConsoleDevice {
    engine: SharedEngine,
    handle: Handle,
    ports: OnceCell<Vec<Option<RuntimePort>>>,
}

impl std::fmt::Debug for ConsoleDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleDevice")
            .field("handle", &self.handle)
            .field("ports", &self.ports.get())
            .finish()
    }
}

impl ConsoleDevice {
    fn new(engine: SharedEngine, handle: Handle) -> Self {
        Self { engine, handle, ports: OnceCell::new() }
    }

    pub fn handle(&self) -> Handle { self.handle }

    /// Port slots of this device, `None` where no port was configured.
    ///
    /// Queried from the engine on first use only; later calls return the same slice.
    /// That holds after the machine is torn down too: `ports`, [`port`](Self::port)
    /// and [`maximum_port_count`](Self::maximum_port_count) keep answering from
    /// the memoized slots, while every [`RuntimePort`] call that reaches the
    /// engine fails with [`ConsoleError::InvalidHandle`](crate::ConsoleError::InvalidHandle).
    /// A device first queried after teardown fails here instead.
    pub fn ports(&self) -> Result<&[Option<RuntimePort>]> {
        capability::require(self.engine.as_ref())?;
        let ports = self.ports.get_or_try_init(|| {
            let count = self.engine.device_maximum_port_count(self.handle)?;
            let mut ports = Vec::with_capacity(count as usize);
            for index in 0..count {
                let port = self.engine.port_at_index(self.handle, index)?;
                ports.push(port.map(|h| RuntimePort::new(self.engine.clone(), h, index)));
            }
            debug!("device {}: discovered {} port slot(s)", self.handle, count);
            Ok::<_, crate::ConsoleError>(ports)
        })?;
        Ok(ports.as_slice())
    }

    pub fn port(&self, index: u32) -> Result<Option<&RuntimePort>> {
        Ok(self.ports()?.get(index as usize).and_then(Option::as_ref))
    }

    /// Number of port slots the running device exposes.
    pub fn maximum_port_count(&self) -> Result<u32> { Ok(self.ports()?.len() as u32) }

    /// Registers `observer` for guest-side port open/close notifications.
    ///
    /// Replaces any earlier observer. Events for ports unknown to this device are dropped.
    pub fn on_port_events<F>(&self, observer: F) -> Result<()>
    where
        F: Fn(PortEvent) + Send + Sync + 'static,
    {
        let by_handle: HashMap<Handle, u32> = self
            .ports()?
            .iter()
            .flatten()
            .map(|p| (p.handle(), p.index()))
            .collect();
        let device = self.handle;
        self.engine.set_port_event_handler(
            self.handle,
            Box::new(move |kind, port| match by_handle.get(&port) {
                Some(&index) => observer(match kind {
                    PortEventKind::Opened => PortEvent::Opened { index },
                    PortEventKind::Closed => PortEvent::Closed { index },
                }),
                None => debug!("device {}: event for unknown port {}", device, port),
            }),
        )
    }
}
