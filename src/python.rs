use crate::config::ConsoleLayout;
use crate::engine::memory::MemoryEngine;
use crate::engine::SharedEngine;
use crate::error::{pyerr, Result};
use crate::runtime;
use pyo3::prelude::*;
use std::sync::Arc;


#[pyclass]
#[derive(Clone, Debug)]
pub struct PlannedDevice {
    #[pyo3(get)] pub maximum_port_count: u32,
    /// Port names by slot; None where the slot is empty.
    #[pyo3(get)] pub ports: Vec<Option<String>>,
}


/// Builds the layout against an in-memory engine, starts it, and reports the
/// port slots the guest would see.
fn plan(json: &str) -> Result<Vec<PlannedDevice>> {
    let layout = ConsoleLayout::from_json(json)?;
    let memory = Arc::new(MemoryEngine::default());
    let engine: SharedEngine = memory.clone();
    let machine = memory.start(layout.build(&engine)?)?;
    let mut planned = Vec::new();
    for device in runtime::discover(&engine, machine)? {
        let Some(console) = device.as_console() else { continue };
        let mut ports = Vec::new();
        for slot in console.ports()? {
            ports.push(match slot {
                Some(port) => Some(port.name()?),
                None => None,
            });
        }
        planned.push(PlannedDevice { maximum_port_count: ports.len() as u32, ports });
    }
    memory.stop(machine)?;
    Ok(planned)
}


#[pyfunction]
fn plan_layout(py: Python<'_>, json: &str) -> PyResult<Vec<PlannedDevice>> {
    py.allow_threads(|| plan(json)).map_err(pyerr)
}


#[pymodule]
#[pyo3(name = "vmconsole")]
fn vmconsole_native(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(plan_layout, m)?)?;
    m.add_class::<PlannedDevice>()?;
    Ok(())
}
