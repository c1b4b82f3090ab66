use crate::capability::Version;
use crate::engine::Handle;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("unsupported capability: requires engine {required}, host provides {available}")]
    UnsupportedCapability { required: Version, available: Version },
    #[error("port index {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: u32, capacity: u32 },
    #[error("invalid handle: {0}")]
    InvalidHandle(Handle),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("console layout error: {0}")]
    Layout(String),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

impl From<serde_json::Error> for ConsoleError {
    fn from(err: serde_json::Error) -> Self { ConsoleError::Layout(err.to_string()) }
}

impl From<anyhow::Error> for ConsoleError {
    fn from(err: anyhow::Error) -> Self { ConsoleError::Layout(format!("{:#}", err)) }
}

#[cfg(feature = "python")]
pub fn pyerr(err: ConsoleError) -> pyo3::PyErr {
    match err {
        ConsoleError::Layout(_) | ConsoleError::IndexOutOfRange { .. } => {
            pyo3::exceptions::PyValueError::new_err(err.to_string())
        }
        other => pyo3::exceptions::PyRuntimeError::new_err(other.to_string()),
    }
}
