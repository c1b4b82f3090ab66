//! Boundary to the virtualization engine.
//!
//! Everything the console subsystem needs from the engine goes through [`Engine`].
//! Engine objects are referred to by opaque [`Handle`]s; a null handle is `None`.

pub mod memory;

use crate::attachment::Attachment;
use crate::capability::Version;
use crate::error::Result;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

/// Opaque, non-null reference to an engine object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Wraps a raw engine reference; `0` is the null handle.
    pub fn from_raw(raw: u64) -> Option<Self> { NonZeroU64::new(raw).map(Handle) }

    pub fn raw(self) -> u64 { self.0.get() }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What the engine's type-identity facility reports about an attachment object.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentProbe {
    pub class_name: String,
    pub properties: serde_json::Value,
}

/// Guest-side port state change reported by a console device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortEventKind {
    Opened,
    Closed,
}

pub type PortEventHandler = Box<dyn Fn(PortEventKind, Handle) + Send + Sync>;

pub type SharedEngine = Arc<dyn Engine>;

/// Calls consumed from the virtualization engine.
///
/// Mutating calls on a running machine are expected to be serialized by the
/// engine itself. Implementations report dead or foreign handles as
/// [`crate::ConsoleError::InvalidHandle`].
pub trait Engine: Send + Sync {
    /// `Ok(())` when the engine is at least `required`, otherwise the version it has.
    fn check_capability(&self, required: Version) -> std::result::Result<(), Version>;

    /// Materializes a concrete attachment; `Unresolved` is never passed here.
    fn new_attachment(&self, attachment: &Attachment) -> Result<Handle>;
    /// `None` when the engine cannot introspect the object.
    fn probe_attachment(&self, attachment: Handle) -> Result<Option<AttachmentProbe>>;

    fn new_device_configuration(&self) -> Result<Handle>;
    fn configured_port_capacity(&self, device: Handle) -> Result<u32>;
    fn set_configured_port_capacity(&self, device: Handle, capacity: u32) -> Result<()>;
    fn new_port_configuration(&self) -> Result<Handle>;
    fn set_configured_port(&self, device: Handle, index: u32, port: Option<Handle>) -> Result<()>;
    fn set_port_name(&self, port: Handle, name: &str) -> Result<()>;
    fn set_port_is_console(&self, port: Handle, is_console: bool) -> Result<()>;
    fn set_port_attachment(&self, port: Handle, attachment: Option<Handle>) -> Result<()>;

    fn runtime_devices(&self, machine: Handle) -> Result<Vec<Handle>>;
    fn device_class(&self, device: Handle) -> Result<String>;
    fn device_maximum_port_count(&self, device: Handle) -> Result<u32>;
    fn port_at_index(&self, device: Handle, index: u32) -> Result<Option<Handle>>;
    fn port_name(&self, port: Handle) -> Result<String>;
    fn port_attachment(&self, port: Handle) -> Result<Option<Handle>>;
    fn set_port_attachment_runtime(&self, port: Handle, attachment: Option<Handle>) -> Result<()>;
    fn set_port_event_handler(&self, device: Handle, handler: PortEventHandler) -> Result<()>;

    fn spice_agent_port_name(&self) -> Result<String>;

    /// Drops the host's reference to an object it created.
    fn release(&self, handle: Handle);
}
