//! Classification of attachment handles returned by the engine.

use crate::attachment::{Attachment, ClipboardAgent, FileAttachment, PipeAttachment};
use crate::engine::{AttachmentProbe, Engine, Handle};
use crate::error::Result;
use log::{debug, warn};
use serde::de::DeserializeOwned;

pub const FILE_ATTACHMENT_CLASS: &str = "FileSerialPortAttachment";
pub const PIPE_ATTACHMENT_CLASS: &str = "FileHandleSerialPortAttachment";
pub const CLIPBOARD_AGENT_CLASS: &str = "SpiceAgentPortAttachment";

/// Engine class name for a concrete attachment; `None` for `Unresolved`.
pub fn class_name(attachment: &Attachment) -> Option<&'static str> {
    match attachment {
        Attachment::FileBacked(_) => Some(FILE_ATTACHMENT_CLASS),
        Attachment::PipeBacked(_) => Some(PIPE_ATTACHMENT_CLASS),
        Attachment::ClipboardAgent(_) => Some(CLIPBOARD_AGENT_CLASS),
        Attachment::Unresolved(_) => None,
    }
}

pub struct AttachmentRegistry;

impl AttachmentRegistry {
    /// Maps an engine handle to a typed attachment.
    ///
    /// `None` only for the null handle. A handle whose kind cannot be
    /// determined, including one the engine refuses to probe, comes back as
    /// [`Attachment::Unresolved`]. Never fails for a non-null handle.
    pub fn resolve(engine: &dyn Engine, handle: Option<Handle>) -> Result<Option<Attachment>> {
        let Some(handle) = handle else { return Ok(None) };
        let resolved = match engine.probe_attachment(handle) {
            Ok(Some(probe)) => Self::classify(handle, &probe),
            Ok(None) => {
                debug!("attachment {} cannot be introspected", handle);
                Attachment::Unresolved(handle)
            }
            Err(e) => {
                warn!("attachment {} could not be probed: {}", handle, e);
                Attachment::Unresolved(handle)
            }
        };
        Ok(Some(resolved))
    }

    fn classify(handle: Handle, probe: &AttachmentProbe) -> Attachment {
        let decoded = match probe.class_name.as_str() {
            FILE_ATTACHMENT_CLASS => decode::<FileAttachment>(probe).map(Attachment::FileBacked),
            PIPE_ATTACHMENT_CLASS => decode::<PipeAttachment>(probe).map(Attachment::PipeBacked),
            CLIPBOARD_AGENT_CLASS => decode::<ClipboardAgent>(probe).map(Attachment::ClipboardAgent),
            other => {
                debug!("attachment {} has unknown class {}", handle, other);
                return Attachment::Unresolved(handle);
            }
        };
        decoded.unwrap_or_else(|e| {
            warn!("attachment {} ({}) has unreadable properties: {}", handle, probe.class_name, e);
            Attachment::Unresolved(handle)
        })
    }
}

fn decode<T: DeserializeOwned>(probe: &AttachmentProbe) -> serde_json::Result<T> {
    serde_json::from_value(probe.properties.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe(class_name: &str, properties: serde_json::Value) -> AttachmentProbe {
        AttachmentProbe { class_name: class_name.to_string(), properties }
    }

    fn h(raw: u64) -> Handle { Handle::from_raw(raw).unwrap() }

    #[test]
    fn known_classes_decode_their_parameters() {
        let a = AttachmentRegistry::classify(h(1), &probe(FILE_ATTACHMENT_CLASS, json!({"path": "x", "append": true})));
        assert_eq!(a, Attachment::file("x", true));

        let a = AttachmentRegistry::classify(h(2), &probe(PIPE_ATTACHMENT_CLASS, json!({"read_fd": 5})));
        assert_eq!(a, Attachment::pipe(Some(5), None));

        let a = AttachmentRegistry::classify(h(3), &probe(CLIPBOARD_AGENT_CLASS, json!({"shares_clipboard": false})));
        assert_eq!(a, Attachment::clipboard_agent(false));
    }

    #[test]
    fn unknown_class_is_unresolved_not_guessed() {
        let a = AttachmentRegistry::classify(h(9), &probe("VirtualSerialBridge", json!({"path": "x"})));
        assert_eq!(a, Attachment::Unresolved(h(9)));
    }

    #[test]
    fn malformed_properties_are_unresolved() {
        let a = AttachmentRegistry::classify(h(4), &probe(FILE_ATTACHMENT_CLASS, json!({"append": "yes"})));
        assert_eq!(a, Attachment::Unresolved(h(4)));
    }

    #[test]
    fn class_names_cover_concrete_kinds() {
        assert_eq!(class_name(&Attachment::file("x", false)), Some(FILE_ATTACHMENT_CLASS));
        assert_eq!(class_name(&Attachment::clipboard_agent(true)), Some(CLIPBOARD_AGENT_CLASS));
        assert_eq!(class_name(&Attachment::Unresolved(h(1))), None);
    }
}
