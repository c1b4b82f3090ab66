use crate::attachment::{push_attachment, Attachment};
use crate::capability;
use crate::engine::{Handle, SharedEngine};
use crate::error::Result;

/// One console port as configured before boot.
///
/// A console port is a two-way channel between a host [`Attachment`] and a
/// guest console port. Setters push to the engine first and only update the
/// local copy once the engine accepted the value. Configurations become
/// unreachable when a machine is started from their device, so they cannot
/// be changed under a running guest.
pub struct PortConfiguration {
    engine: SharedEngine,
    handle: Handle,
    name: Option<String>,
    is_console: bool,
    attachment: Option<Attachment>,
}

impl std::fmt::Debug for PortConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortConfiguration")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("is_console", &self.is_console)
            .field("attachment", &self.attachment)
            .finish()
    }
}

impl PortConfiguration {
    pub fn new(engine: SharedEngine) -> Result<Self> {
        capability::require(engine.as_ref())?;
        let handle = engine.new_port_configuration()?;
        Ok(Self { engine, handle, name: None, is_console: false, attachment: None })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Result<Self> {
        self.set_name(name)?;
        Ok(self)
    }

    pub fn with_is_console(mut self, is_console: bool) -> Result<Self> {
        self.set_is_console(is_console)?;
        Ok(self)
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Result<Self> {
        self.set_attachment(Some(attachment))?;
        Ok(self)
    }

    pub fn handle(&self) -> Handle { self.handle }

    /// Port name; unnamed unless set.
    pub fn name(&self) -> Option<&str> { self.name.as_deref() }

    /// Whether the port may be used as the system console. Defaults to `false`.
    pub fn is_console(&self) -> bool { self.is_console }

    pub fn attachment(&self) -> Option<&Attachment> { self.attachment.as_ref() }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        capability::require(self.engine.as_ref())?;
        let name = name.into();
        self.engine.set_port_name(self.handle, &name)?;
        self.name = Some(name);
        Ok(())
    }

    pub fn set_is_console(&mut self, is_console: bool) -> Result<()> {
        capability::require(self.engine.as_ref())?;
        self.engine.set_port_is_console(self.handle, is_console)?;
        self.is_console = is_console;
        Ok(())
    }

    pub fn set_attachment(&mut self, attachment: Option<Attachment>) -> Result<()> {
        capability::require(self.engine.as_ref())?;
        let engine = self.engine.as_ref();
        let port = self.handle;
        push_attachment(engine, attachment.as_ref(), |h| engine.set_port_attachment(port, h))?;
        self.attachment = attachment;
        Ok(())
    }
}

impl Drop for PortConfiguration {
    fn drop(&mut self) {
        self.engine.release(self.handle);
    }
}
