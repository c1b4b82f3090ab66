//! In-process engine.
//!
//! Keeps every engine object in a handle table and models just enough of a
//! machine lifecycle (start, state-change signal, teardown) for console
//! devices. Every engine call except the capability check is counted, which
//! lets callers assert how much traffic an operation caused.
//!
//! A released attachment or configuration object is freed as soon as nothing
//! in the table refers to it; its handle is invalid from then on.

use super::{AttachmentProbe, Engine, Handle, PortEventHandler, PortEventKind};
use crate::attachment::Attachment;
use crate::capability::{Version, CONSOLE_MIN_VERSION};
use crate::device::DeviceConfiguration;
use crate::error::{ConsoleError, Result};
use crate::registry;
use crate::runtime::CONSOLE_DEVICE_CLASS;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

#[derive(Debug, Clone)]
pub struct MemoryEngineConfig {
    /// Version reported to the capability gate.
    pub version: Version,
    /// Capacity of a freshly created console device configuration.
    pub default_port_capacity: u32,
    /// Largest port capacity a device configuration may declare.
    pub maximum_port_count: u32,
    pub spice_agent_port_name: String,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            version: CONSOLE_MIN_VERSION,
            default_port_capacity: 16,
            maximum_port_count: 64,
            spice_agent_port_name: "com.redhat.spice.0".to_string(),
        }
    }
}

enum Object {
    Attachment(Option<AttachmentProbe>),
    DeviceConfig { capacity: u32, ports: BTreeMap<u32, Handle> },
    PortConfig { name: Option<String>, is_console: bool, attachment: Option<Handle> },
    RuntimeDevice { class_name: String, ports: Vec<Option<Handle>>, handler: Option<Arc<PortEventHandler>> },
    RuntimePort { name: String, attachment: Option<Handle> },
}

impl Object {
    fn references(&self) -> Vec<Handle> {
        match self {
            Object::Attachment(_) => Vec::new(),
            Object::DeviceConfig { ports, .. } => ports.values().copied().collect(),
            Object::PortConfig { attachment, .. } | Object::RuntimePort { attachment, .. } => {
                attachment.iter().copied().collect()
            }
            Object::RuntimeDevice { ports, .. } => ports.iter().flatten().copied().collect(),
        }
    }
}

struct Machine {
    devices: Vec<Handle>,
    running: bool,
    signal: EventFd,
}

#[derive(Default)]
struct State {
    next: u64,
    objects: HashMap<Handle, Object>,
    released: HashSet<Handle>,
    machines: HashMap<Handle, Machine>,
}

impl State {
    fn next_handle(&mut self) -> Handle {
        let handle = Handle(NonZeroU64::MIN.saturating_add(self.next));
        self.next += 1;
        handle
    }

    fn insert(&mut self, object: Object) -> Handle {
        let handle = self.next_handle();
        self.objects.insert(handle, object);
        handle
    }

    fn object_mut(&mut self, handle: Handle) -> Result<&mut Object> {
        self.objects.get_mut(&handle).ok_or(ConsoleError::InvalidHandle(handle))
    }

    /// Frees released objects nothing refers to, repeating until freeing one
    /// orphans no other.
    fn sweep(&mut self) {
        loop {
            let referenced: HashSet<Handle> = self.objects.values().flat_map(Object::references).collect();
            let dead: Vec<Handle> = self
                .released
                .iter()
                .copied()
                .filter(|h| self.objects.contains_key(h) && !referenced.contains(h))
                .collect();
            if dead.is_empty() {
                return;
            }
            for handle in dead {
                self.objects.remove(&handle);
                debug!("freed {}", handle);
            }
        }
    }
}

pub struct MemoryEngine {
    config: MemoryEngineConfig,
    version: Mutex<Version>,
    calls: AtomicUsize,
    calls_by_name: Mutex<HashMap<&'static str, usize>>,
    state: Mutex<State>,
}

impl Default for MemoryEngine {
    fn default() -> Self { Self::new(MemoryEngineConfig::default()) }
}

impl MemoryEngine {
    pub fn new(config: MemoryEngineConfig) -> Self {
        Self {
            version: Mutex::new(config.version),
            config,
            calls: AtomicUsize::new(0),
            calls_by_name: Mutex::new(HashMap::new()),
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &MemoryEngineConfig { &self.config }

    /// Changes the version reported to the capability gate.
    pub fn set_version(&self, version: Version) {
        *self.version.lock().unwrap_or_else(PoisonError::into_inner) = version;
    }

    /// Total engine calls made so far, capability checks excluded.
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }

    pub fn calls_to(&self, method: &str) -> usize {
        let by_name = self.calls_by_name.lock().unwrap_or_else(PoisonError::into_inner);
        by_name.get(method).copied().unwrap_or(0)
    }

    pub fn is_released(&self, handle: Handle) -> bool { self.state().released.contains(&handle) }

    /// Whether `handle` still names a live object.
    pub fn is_live(&self, handle: Handle) -> bool { self.state().objects.contains_key(&handle) }

    /// Starts a machine from console device configurations.
    ///
    /// The configurations are consumed: each becomes a runtime console device
    /// whose ports mirror the configured slots. The machine's state-changed
    /// signal fires once the runtime devices exist.
    pub fn start(&self, devices: Vec<DeviceConfiguration>) -> Result<Handle> {
        let signal = EventFd::new(EFD_NONBLOCK).map_err(|e| ConsoleError::Engine(e.to_string()))?;
        let machine = {
            let mut state = self.state();
            let mut runtime = Vec::with_capacity(devices.len());
            for device in &devices {
                let (capacity, configured) = match state.objects.get(&device.handle()) {
                    Some(Object::DeviceConfig { capacity, ports }) => (*capacity, ports.clone()),
                    _ => return Err(ConsoleError::InvalidHandle(device.handle())),
                };
                let mut ports = vec![None; capacity as usize];
                for (index, port_cfg) in configured {
                    let (name, attachment) = match state.objects.get(&port_cfg) {
                        Some(Object::PortConfig { name, attachment, .. }) => {
                            (name.clone().unwrap_or_default(), *attachment)
                        }
                        _ => return Err(ConsoleError::InvalidHandle(port_cfg)),
                    };
                    ports[index as usize] = Some(state.insert(Object::RuntimePort { name, attachment }));
                }
                runtime.push(state.insert(Object::RuntimeDevice {
                    class_name: CONSOLE_DEVICE_CLASS.to_string(),
                    ports,
                    handler: None,
                }));
            }
            let machine = state.next_handle();
            state.machines.insert(machine, Machine { devices: runtime, running: true, signal });
            machine
        };
        info!("machine {} started with {} console device(s)", machine, devices.len());
        self.notify(machine)?;
        drop(devices);
        Ok(machine)
    }

    /// Tears the machine down; its runtime devices and ports become invalid.
    pub fn stop(&self, machine: Handle) -> Result<()> {
        let mut state = self.state();
        let entry = state.machines.get_mut(&machine).ok_or(ConsoleError::InvalidHandle(machine))?;
        if !entry.running {
            return Ok(());
        }
        entry.running = false;
        let devices = std::mem::take(&mut entry.devices);
        for device in devices {
            if let Some(Object::RuntimeDevice { ports, .. }) = state.objects.remove(&device) {
                for port in ports.into_iter().flatten() {
                    state.objects.remove(&port);
                }
            }
        }
        state.sweep();
        drop(state);
        info!("machine {} stopped", machine);
        self.notify(machine)
    }

    pub fn is_running(&self, machine: Handle) -> bool {
        self.state().machines.get(&machine).map(|m| m.running).unwrap_or(false)
    }

    /// Signal written on every machine state change; callers wait on it before discovery.
    pub fn state_changed_signal(&self, machine: Handle) -> Result<EventFd> {
        let state = self.state();
        let entry = state.machines.get(&machine).ok_or(ConsoleError::InvalidHandle(machine))?;
        entry.signal.try_clone().map_err(|e| ConsoleError::Engine(e.to_string()))
    }

    /// Adds a runtime device of an arbitrary class to a running machine.
    pub fn add_runtime_device(&self, machine: Handle, class_name: &str) -> Result<Handle> {
        let mut state = self.state();
        let running = state.machines.get(&machine).map(|m| m.running).unwrap_or(false);
        if !running {
            return Err(ConsoleError::InvalidHandle(machine));
        }
        let device = state.insert(Object::RuntimeDevice {
            class_name: class_name.to_string(),
            ports: Vec::new(),
            handler: None,
        });
        if let Some(m) = state.machines.get_mut(&machine) {
            m.devices.push(device);
        }
        Ok(device)
    }

    /// Creates an attachment object the registry has no mapping for.
    ///
    /// With `properties` set to `None` the object refuses introspection entirely.
    pub fn foreign_attachment(&self, class_name: &str, properties: Option<serde_json::Value>) -> Handle {
        let probe = properties.map(|properties| AttachmentProbe { class_name: class_name.to_string(), properties });
        self.state().insert(Object::Attachment(probe))
    }

    /// Replaces a runtime port's attachment as if done by another client of the engine.
    pub fn replace_attachment_externally(&self, port: Handle, attachment: Option<Handle>) -> Result<()> {
        let mut state = self.state();
        match state.object_mut(port)? {
            Object::RuntimePort { attachment: slot, .. } => *slot = attachment,
            _ => return Err(ConsoleError::InvalidHandle(port)),
        }
        state.sweep();
        Ok(())
    }

    /// Reports a guest-side open or close of the port at `index`.
    pub fn emit_port_event(&self, device: Handle, index: u32, kind: PortEventKind) -> Result<()> {
        let (handler, port) = {
            let state = self.state();
            match state.objects.get(&device) {
                Some(Object::RuntimeDevice { ports, handler, .. }) => {
                    let port = ports
                        .get(index as usize)
                        .copied()
                        .flatten()
                        .ok_or(ConsoleError::IndexOutOfRange { index, capacity: ports.len() as u32 })?;
                    (handler.clone(), port)
                }
                _ => return Err(ConsoleError::InvalidHandle(device)),
            }
        };
        if let Some(handler) = handler {
            (**handler)(kind, port);
        }
        Ok(())
    }

    fn notify(&self, machine: Handle) -> Result<()> {
        let state = self.state();
        let entry = state.machines.get(&machine).ok_or(ConsoleError::InvalidHandle(machine))?;
        entry.signal.write(1).map_err(|e| ConsoleError::Engine(e.to_string()))
    }

    fn state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn record(&self, method: &'static str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut by_name = self.calls_by_name.lock().unwrap_or_else(PoisonError::into_inner);
        *by_name.entry(method).or_insert(0) += 1;
    }

    fn with_port_config<T>(&self, port: Handle, f: impl FnOnce(&mut Option<String>, &mut bool, &mut Option<Handle>) -> T) -> Result<T> {
        let mut state = self.state();
        let out = match state.object_mut(port)? {
            Object::PortConfig { name, is_console, attachment } => f(name, is_console, attachment),
            _ => return Err(ConsoleError::InvalidHandle(port)),
        };
        state.sweep();
        Ok(out)
    }

    fn with_runtime_port<T>(&self, port: Handle, f: impl FnOnce(&mut String, &mut Option<Handle>) -> T) -> Result<T> {
        let mut state = self.state();
        let out = match state.object_mut(port)? {
            Object::RuntimePort { name, attachment } => f(name, attachment),
            _ => return Err(ConsoleError::InvalidHandle(port)),
        };
        state.sweep();
        Ok(out)
    }

    fn check_attachment(state: &State, attachment: Option<Handle>) -> Result<()> {
        match attachment {
            Some(h) if !matches!(state.objects.get(&h), Some(Object::Attachment(_))) => Err(ConsoleError::InvalidHandle(h)),
            _ => Ok(()),
        }
    }
}

impl Engine for MemoryEngine {
    fn check_capability(&self, required: Version) -> std::result::Result<(), Version> {
        let version = *self.version.lock().unwrap_or_else(PoisonError::into_inner);
        if version >= required { Ok(()) } else { Err(version) }
    }

    fn new_attachment(&self, attachment: &Attachment) -> Result<Handle> {
        self.record("new_attachment");
        let properties = match attachment {
            Attachment::FileBacked(a) => serde_json::to_value(a),
            Attachment::PipeBacked(a) => serde_json::to_value(a),
            Attachment::ClipboardAgent(a) => serde_json::to_value(a),
            Attachment::Unresolved(h) => return Err(ConsoleError::InvalidHandle(*h)),
        }
        .map_err(|e| ConsoleError::Engine(e.to_string()))?;
        let class_name = registry::class_name(attachment).unwrap_or_default().to_string();
        let handle = self.state().insert(Object::Attachment(Some(AttachmentProbe { class_name, properties })));
        debug!("created attachment {}", handle);
        Ok(handle)
    }

    fn probe_attachment(&self, attachment: Handle) -> Result<Option<AttachmentProbe>> {
        self.record("probe_attachment");
        match self.state().objects.get(&attachment) {
            Some(Object::Attachment(probe)) => Ok(probe.clone()),
            _ => Err(ConsoleError::InvalidHandle(attachment)),
        }
    }

    fn new_device_configuration(&self) -> Result<Handle> {
        self.record("new_device_configuration");
        let capacity = self.config.default_port_capacity.min(self.config.maximum_port_count);
        Ok(self.state().insert(Object::DeviceConfig { capacity, ports: BTreeMap::new() }))
    }

    fn configured_port_capacity(&self, device: Handle) -> Result<u32> {
        self.record("configured_port_capacity");
        match self.state().object_mut(device)? {
            Object::DeviceConfig { capacity, .. } => Ok(*capacity),
            _ => Err(ConsoleError::InvalidHandle(device)),
        }
    }

    fn set_configured_port_capacity(&self, device: Handle, new_capacity: u32) -> Result<()> {
        self.record("set_configured_port_capacity");
        if new_capacity > self.config.maximum_port_count {
            return Err(ConsoleError::Engine(format!(
                "port count {} exceeds the supported maximum of {}",
                new_capacity, self.config.maximum_port_count
            )));
        }
        match self.state().object_mut(device)? {
            Object::DeviceConfig { capacity, ports } => {
                if let Some((&index, _)) = ports.range(new_capacity..).next() {
                    return Err(ConsoleError::IndexOutOfRange { index, capacity: new_capacity });
                }
                *capacity = new_capacity;
                Ok(())
            }
            _ => Err(ConsoleError::InvalidHandle(device)),
        }
    }

    fn new_port_configuration(&self) -> Result<Handle> {
        self.record("new_port_configuration");
        Ok(self.state().insert(Object::PortConfig { name: None, is_console: false, attachment: None }))
    }

    fn set_configured_port(&self, device: Handle, index: u32, port: Option<Handle>) -> Result<()> {
        self.record("set_configured_port");
        let mut state = self.state();
        if let Some(p) = port {
            if !matches!(state.objects.get(&p), Some(Object::PortConfig { .. })) {
                return Err(ConsoleError::InvalidHandle(p));
            }
        }
        match state.object_mut(device)? {
            Object::DeviceConfig { capacity, ports } => {
                if index >= *capacity {
                    return Err(ConsoleError::IndexOutOfRange { index, capacity: *capacity });
                }
                match port {
                    Some(p) => ports.insert(index, p),
                    None => ports.remove(&index),
                };
            }
            _ => return Err(ConsoleError::InvalidHandle(device)),
        }
        state.sweep();
        Ok(())
    }

    fn set_port_name(&self, port: Handle, name: &str) -> Result<()> {
        self.record("set_port_name");
        self.with_port_config(port, |slot, _, _| *slot = Some(name.to_string()))
    }

    fn set_port_is_console(&self, port: Handle, is_console: bool) -> Result<()> {
        self.record("set_port_is_console");
        self.with_port_config(port, |_, slot, _| *slot = is_console)
    }

    fn set_port_attachment(&self, port: Handle, attachment: Option<Handle>) -> Result<()> {
        self.record("set_port_attachment");
        Self::check_attachment(&self.state(), attachment)?;
        self.with_port_config(port, |_, _, slot| *slot = attachment)
    }

    fn runtime_devices(&self, machine: Handle) -> Result<Vec<Handle>> {
        self.record("runtime_devices");
        match self.state().machines.get(&machine) {
            Some(m) if m.running => Ok(m.devices.clone()),
            _ => Err(ConsoleError::InvalidHandle(machine)),
        }
    }

    fn device_class(&self, device: Handle) -> Result<String> {
        self.record("device_class");
        match self.state().objects.get(&device) {
            Some(Object::RuntimeDevice { class_name, .. }) => Ok(class_name.clone()),
            _ => Err(ConsoleError::InvalidHandle(device)),
        }
    }

    fn device_maximum_port_count(&self, device: Handle) -> Result<u32> {
        self.record("device_maximum_port_count");
        match self.state().objects.get(&device) {
            Some(Object::RuntimeDevice { ports, .. }) => Ok(ports.len() as u32),
            _ => Err(ConsoleError::InvalidHandle(device)),
        }
    }

    fn port_at_index(&self, device: Handle, index: u32) -> Result<Option<Handle>> {
        self.record("port_at_index");
        match self.state().objects.get(&device) {
            Some(Object::RuntimeDevice { ports, .. }) => Ok(ports.get(index as usize).copied().flatten()),
            _ => Err(ConsoleError::InvalidHandle(device)),
        }
    }

    fn port_name(&self, port: Handle) -> Result<String> {
        self.record("port_name");
        self.with_runtime_port(port, |name, _| name.clone())
    }

    fn port_attachment(&self, port: Handle) -> Result<Option<Handle>> {
        self.record("port_attachment");
        self.with_runtime_port(port, |_, attachment| *attachment)
    }

    fn set_port_attachment_runtime(&self, port: Handle, attachment: Option<Handle>) -> Result<()> {
        self.record("set_port_attachment_runtime");
        Self::check_attachment(&self.state(), attachment)?;
        self.with_runtime_port(port, |_, slot| *slot = attachment)
    }

    fn set_port_event_handler(&self, device: Handle, new_handler: PortEventHandler) -> Result<()> {
        self.record("set_port_event_handler");
        match self.state().object_mut(device)? {
            Object::RuntimeDevice { handler, .. } => {
                *handler = Some(Arc::new(new_handler));
                Ok(())
            }
            _ => Err(ConsoleError::InvalidHandle(device)),
        }
    }

    fn spice_agent_port_name(&self) -> Result<String> {
        self.record("spice_agent_port_name");
        Ok(self.config.spice_agent_port_name.clone())
    }

    fn release(&self, handle: Handle) {
        self.record("release");
        let mut state = self.state();
        state.released.insert(handle);
        state.sweep();
    }
}
