//! Multi-port virtio console devices for a virtual-machine control library.
//!
//! Console ports are configured before boot ([`DeviceConfiguration`],
//! [`PortTable`], [`PortConfiguration`]), discovered after the machine starts
//! ([`runtime::discover`]), and rebound to other attachments while the guest
//! runs ([`RuntimePort::rebind`]). All engine traffic goes through the
//! [`Engine`] trait and is gated by [`capability::require`].

pub mod attachment;
pub mod capability;
pub mod config;
pub mod device;
pub mod engine;
mod error;
pub mod port;
pub mod registry;
pub mod runtime;
pub mod table;

#[cfg(feature = "python")]
mod python;


pub use attachment::{Attachment, ClipboardAgent, FileAttachment, PipeAttachment};
pub use capability::{spice_agent_port_name, Version, CONSOLE_MIN_VERSION};
pub use config::ConsoleLayout;
pub use device::DeviceConfiguration;
pub use engine::{Engine, Handle, SharedEngine};
pub use error::{ConsoleError, Result};
pub use port::PortConfiguration;
pub use registry::AttachmentRegistry;
pub use runtime::{discover, ConsoleDevice, PortEvent, RuntimeDevice, RuntimePort};
pub use table::{PlaceError, PortTable};
