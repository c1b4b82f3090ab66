use crate::engine::{Engine, Handle};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Host-side transport backing one console port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    FileBacked(FileAttachment),
    PipeBacked(PipeAttachment),
    ClipboardAgent(ClipboardAgent),
    /// An attachment exists but its kind could not be determined.
    #[serde(skip)]
    Unresolved(Handle),
}

/// Guest output written to a host file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: PathBuf,
    /// Append to an existing file instead of truncating it.
    #[serde(default)]
    pub append: bool,
}

/// Guest I/O carried over host file descriptors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeAttachment {
    /// Host reads guest output from this descriptor.
    #[serde(default)]
    pub read_fd: Option<RawFd>,
    /// Host writes guest input to this descriptor.
    #[serde(default)]
    pub write_fd: Option<RawFd>,
}

/// Spice agent port enabling clipboard sharing with the guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardAgent {
    #[serde(default = "default_shares_clipboard")]
    pub shares_clipboard: bool,
}

fn default_shares_clipboard() -> bool { true }

impl Default for ClipboardAgent {
    fn default() -> Self { Self { shares_clipboard: true } }
}

impl Attachment {
    pub fn file(path: impl Into<PathBuf>, append: bool) -> Self {
        Attachment::FileBacked(FileAttachment { path: path.into(), append })
    }

    pub fn pipe(read_fd: Option<RawFd>, write_fd: Option<RawFd>) -> Self {
        Attachment::PipeBacked(PipeAttachment { read_fd, write_fd })
    }

    pub fn clipboard_agent(shares_clipboard: bool) -> Self {
        Attachment::ClipboardAgent(ClipboardAgent { shares_clipboard })
    }

    pub fn is_resolved(&self) -> bool { !matches!(self, Attachment::Unresolved(_)) }

    /// Returns a handle the engine can attach to a port, and whether the caller owns it.
    ///
    /// Concrete kinds are materialized anew; `Unresolved` re-offers its existing handle.
    pub(crate) fn materialize(&self, engine: &dyn Engine) -> Result<(Handle, bool)> {
        match self {
            Attachment::Unresolved(handle) => Ok((*handle, false)),
            concrete => engine.new_attachment(concrete).map(|h| (h, true)),
        }
    }
}

/// Pushes `attachment` to the engine through `push`, releasing any handle created for it.
pub(crate) fn push_attachment<F>(engine: &dyn Engine, attachment: Option<&Attachment>, push: F) -> Result<()>
where
    F: FnOnce(Option<Handle>) -> Result<()>,
{
    match attachment {
        None => push(None),
        Some(a) => {
            let (handle, owned) = a.materialize(engine)?;
            let res = push(Some(handle));
            if owned {
                engine.release(handle);
            }
            res
        }
    }
}
