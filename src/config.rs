use crate::attachment::Attachment;
use crate::device::DeviceConfiguration;
use crate::engine::SharedEngine;
use crate::error::{ConsoleError, Result};
use crate::port::PortConfiguration;
use anyhow::Context;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Declarative description of the console devices of one machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLayout {
    #[serde(default)]
    pub devices: Vec<DeviceLayout>,
}

/// One virtio console device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLayout {
    /// Declared capacity (None = engine default)
    #[serde(default)]
    pub maximum_port_count: Option<u32>,
    #[serde(default)]
    pub ports: Vec<PortLayout>,
}

/// One port slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortLayout {
    pub index: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_console: bool,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl ConsoleLayout {
    pub fn from_json(json: &str) -> Result<Self> {
        let layout: ConsoleLayout = serde_json::from_str(json)?;
        layout.validate()?;
        Ok(layout)
    }

    /// Reads a JSON layout from disk.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading console layout {}", path.display()))?;
        let layout = Self::from_json(&raw)
            .with_context(|| format!("parsing console layout {}", path.display()))?;
        Ok(layout)
    }

    /// Rejects layouts that place two ports in the same slot.
    pub fn validate(&self) -> Result<()> {
        for (d, device) in self.devices.iter().enumerate() {
            let mut seen = HashSet::new();
            for port in &device.ports {
                if !seen.insert(port.index) {
                    return Err(ConsoleError::Layout(format!(
                        "device {}: port index {} used more than once",
                        d, port.index
                    )));
                }
            }
        }
        Ok(())
    }

    /// Creates the device configurations against `engine`, ready for machine start.
    pub fn build(&self, engine: &SharedEngine) -> Result<Vec<DeviceConfiguration>> {
        self.validate()?;
        let mut devices = Vec::with_capacity(self.devices.len());
        for layout in &self.devices {
            let mut device = DeviceConfiguration::new(engine.clone())?;
            if let Some(count) = layout.maximum_port_count {
                device.set_maximum_port_count(count)?;
            }
            for port in &layout.ports {
                let mut config = PortConfiguration::new(engine.clone())?;
                if let Some(name) = &port.name {
                    config.set_name(name.as_str())?;
                }
                if port.is_console {
                    config.set_is_console(true)?;
                }
                if let Some(attachment) = &port.attachment {
                    config.set_attachment(Some(attachment.clone()))?;
                }
                device.place_port(port.index, config)?;
            }
            debug!("built console device {} with {} port(s)", device.handle(), layout.ports.len());
            devices.push(device);
        }
        Ok(devices)
    }
}
