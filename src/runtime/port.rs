use crate::attachment::{push_attachment, Attachment};
use crate::capability;
use crate::engine::{Handle, SharedEngine};
use crate::error::Result;
use crate::registry::AttachmentRegistry;
use log::debug;
use std::sync::{Mutex, PoisonError};

/// Last attachment this process set on or observed from a port.
///
/// Changes only through [`RuntimePort::rebind`] and [`RuntimePort::live`].
#[derive(Debug, Default)]
pub(crate) struct AttachmentBinding {
    cached: Mutex<Option<Attachment>>,
}

impl AttachmentBinding {
    fn get(&self) -> Option<Attachment> { self.cached.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    fn set(&self, attachment: Option<Attachment>) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = attachment;
    }
}

/// A console port of a running virtio console device.
///
/// Its lifetime is tied to the machine; after teardown every call that
/// reaches the engine fails with [`crate::ConsoleError::InvalidHandle`].
/// `live` and `rebind` on the same port need external serialization to give a
/// meaningful ordering.
pub struct RuntimePort {
    engine: SharedEngine,
    handle: Handle,
    index: u32,
    binding: AttachmentBinding,
}

impl std::fmt::Debug for RuntimePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePort")
            .field("handle", &self.handle)
            .field("index", &self.index)
            .field("cached", &self.binding.get())
            .finish()
    }
}

impl RuntimePort {
    pub(crate) fn new(engine: SharedEngine, handle: Handle, index: u32) -> Self {
        Self { engine, handle, index, binding: AttachmentBinding::default() }
    }

    pub fn handle(&self) -> Handle { self.handle }

    /// Slot this port occupies on its device.
    pub fn index(&self) -> u32 { self.index }

    /// Name the engine reports for this port; empty when none was configured.
    pub fn name(&self) -> Result<String> {
        capability::require(self.engine.as_ref())?;
        self.engine.port_name(self.handle)
    }

    /// Last attachment set with [`rebind`](Self::rebind) or observed with
    /// [`live`](Self::live). Never touches the engine.
    pub fn cached(&self) -> Option<Attachment> { self.binding.get() }

    /// Attachment the engine currently has on this port; refreshes the cache.
    pub fn live(&self) -> Result<Option<Attachment>> {
        capability::require(self.engine.as_ref())?;
        let handle = self.engine.port_attachment(self.handle)?;
        let attachment = AttachmentRegistry::resolve(self.engine.as_ref(), handle)?;
        self.binding.set(attachment.clone());
        Ok(attachment)
    }

    /// Connects `attachment` to the port while the guest runs; `None` disconnects it.
    pub fn rebind(&self, attachment: Option<Attachment>) -> Result<()> {
        capability::require(self.engine.as_ref())?;
        let engine = self.engine.as_ref();
        let port = self.handle;
        push_attachment(engine, attachment.as_ref(), |h| engine.set_port_attachment_runtime(port, h))?;
        debug!("port {} (index {}): attachment rebound to {:?}", self.handle, self.index, attachment);
        self.binding.set(attachment);
        Ok(())
    }
}
