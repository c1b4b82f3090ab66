use crate::engine::Engine;
use crate::error::{ConsoleError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine version, compared lexicographically (major, then minor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self { Self { major, minor } }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// First engine release with multi-port console devices and runtime attachment rebinding.
pub const CONSOLE_MIN_VERSION: Version = Version::new(13, 0);

/// Guard called at the top of every operation that talks to the engine.
///
/// Fails with [`ConsoleError::UnsupportedCapability`] before any other engine call is made.
pub fn require(engine: &dyn Engine) -> Result<()> {
    engine
        .check_capability(CONSOLE_MIN_VERSION)
        .map_err(|available| ConsoleError::UnsupportedCapability {
            required: CONSOLE_MIN_VERSION,
            available,
        })
}

/// Name of the console port the guest's Spice agent listens on.
///
/// Always the same value for a given engine.
pub fn spice_agent_port_name(engine: &dyn Engine) -> Result<String> {
    require(engine)?;
    engine.spice_agent_port_name()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_is_major_then_minor() {
        assert!(Version::new(12, 9) < CONSOLE_MIN_VERSION);
        assert!(Version::new(13, 0) >= CONSOLE_MIN_VERSION);
        assert!(Version::new(14, 0) > Version::new(13, 7));
        assert_eq!(Version::new(13, 1).to_string(), "13.1");
    }
}
