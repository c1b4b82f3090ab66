use std::sync::{Arc, Mutex};
use vmconsole::engine::memory::MemoryEngine;
use vmconsole::engine::{Engine, PortEventKind};
use vmconsole::{
    discover, spice_agent_port_name, Attachment, ConsoleError, DeviceConfiguration, Handle, PortConfiguration,
    PortEvent, RuntimeDevice, SharedEngine, Version,
};

struct Harness {
    memory: Arc<MemoryEngine>,
    engine: SharedEngine,
}

impl Harness {
    fn new() -> Self {
        let memory = Arc::new(MemoryEngine::default());
        let engine: SharedEngine = memory.clone();
        Self { memory, engine }
    }

    fn port(&self, name: &str, attachment: Option<Attachment>) -> PortConfiguration {
        let mut port = PortConfiguration::new(self.engine.clone()).unwrap().with_name(name).unwrap();
        port.set_attachment(attachment).unwrap();
        port
    }

    /// Starts a machine and waits for its state-changed signal before returning.
    fn start(&self, devices: Vec<DeviceConfiguration>) -> Handle {
        let machine = self.memory.start(devices).unwrap();
        let signal = self.memory.state_changed_signal(machine).unwrap();
        assert_eq!(signal.read().unwrap(), 1);
        machine
    }

    fn single_console(&self, machine: Handle) -> RuntimeDevice {
        let mut devices = discover(&self.engine, machine).unwrap();
        assert_eq!(devices.len(), 1);
        devices.remove(0)
    }
}

#[test]
fn sparse_slots_are_preserved_positionally() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.set_maximum_port_count(4).unwrap();
    device.place_port(0, h.port("p0", None)).unwrap();
    device.place_port(2, h.port("p2", None)).unwrap();
    let machine = h.start(vec![device]);

    let device = h.single_console(machine);
    let ports = device.as_console().unwrap().ports().unwrap();
    assert_eq!(ports.len(), 4);
    assert_eq!(ports[0].as_ref().unwrap().name().unwrap(), "p0");
    assert!(ports[1].is_none());
    assert_eq!(ports[2].as_ref().unwrap().name().unwrap(), "p2");
    assert_eq!(ports[2].as_ref().unwrap().index(), 2);
    assert!(ports[3].is_none());
}

#[test]
fn configured_file_attachment_resolves_after_start() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", Some(Attachment::file("x", false)))).unwrap();
    let machine = h.start(vec![device]);

    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();
    assert_eq!(port.cached(), None);
    assert_eq!(port.live().unwrap(), Some(Attachment::file("x", false)));
    assert_eq!(port.cached(), Some(Attachment::file("x", false)));
}

#[test]
fn unsupported_engine_fails_every_operation_without_engine_calls() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", None)).unwrap();
    let machine = h.start(vec![device]);
    let devices = discover(&h.engine, machine).unwrap();
    let console = devices[0].as_console().unwrap();
    // configurations held across the version change so no drop reaches the engine
    let mut spare_device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    spare_device.place_port(0, h.port("held", None)).unwrap();
    let mut spare_port = h.port("spare", None);
    let unplaced = h.port("unplaced", None);

    h.memory.set_version(Version::new(12, 6));
    let before = h.memory.calls();

    let unsupported = |r: vmconsole::Result<()>| {
        assert!(matches!(
            r,
            Err(ConsoleError::UnsupportedCapability { required, available })
                if required == vmconsole::CONSOLE_MIN_VERSION && available == Version::new(12, 6)
        ));
    };
    unsupported(DeviceConfiguration::new(h.engine.clone()).map(drop));
    unsupported(PortConfiguration::new(h.engine.clone()).map(drop));
    unsupported(discover(&h.engine, machine).map(drop));
    unsupported(console.ports().map(drop));
    unsupported(spice_agent_port_name(h.engine.as_ref()).map(drop));
    unsupported(console.on_port_events(|_| {}));
    unsupported(spare_port.set_name("renamed"));
    unsupported(spare_port.set_is_console(true));
    unsupported(spare_port.set_attachment(Some(Attachment::file("y", false))));
    unsupported(spare_device.ports().capacity().map(drop));
    unsupported(spare_device.maximum_port_count().map(drop));
    unsupported(spare_device.set_maximum_port_count(2));
    unsupported(spare_device.ports_mut().take(0).map(drop));
    let rejected = spare_device.place_port(1, unplaced).unwrap_err();
    let unplaced = rejected.config;
    unsupported(Err(rejected.error));
    assert_eq!(h.memory.calls(), before);

    assert_eq!(spare_port.name(), Some("spare"));
    assert!(!spare_port.is_console());
    assert!(spare_device.ports().contains(0));
    assert_eq!(unplaced.name(), Some("unplaced"));
}

#[test]
fn gated_runtime_port_calls_make_no_engine_calls() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", Some(Attachment::clipboard_agent(true)))).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();
    port.live().unwrap();

    h.memory.set_version(Version::new(11, 0));
    let before = h.memory.calls();
    assert!(matches!(port.name(), Err(ConsoleError::UnsupportedCapability { .. })));
    assert!(matches!(port.live(), Err(ConsoleError::UnsupportedCapability { .. })));
    assert!(matches!(port.rebind(None), Err(ConsoleError::UnsupportedCapability { .. })));
    assert_eq!(h.memory.calls(), before);
    // the cached path never fails and keeps its last value
    assert_eq!(port.cached(), Some(Attachment::clipboard_agent(true)));
}

#[test]
fn rebind_round_trips_through_live() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", None)).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();

    for attachment in [
        Attachment::file("/var/log/guest.log", true),
        Attachment::pipe(Some(3), Some(4)),
        Attachment::clipboard_agent(false),
    ] {
        port.rebind(Some(attachment.clone())).unwrap();
        assert_eq!(port.cached(), Some(attachment.clone()));
        assert_eq!(port.live().unwrap(), Some(attachment));
    }
}

#[test]
fn disconnect_clears_live_and_cached() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", Some(Attachment::file("x", false)))).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();

    assert!(port.live().unwrap().is_some());
    port.rebind(None).unwrap();
    assert_eq!(port.cached(), None);
    assert_eq!(port.live().unwrap(), None);
    assert_eq!(port.cached(), None);
}

#[test]
fn ports_are_discovered_once() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.set_maximum_port_count(3).unwrap();
    device.place_port(1, h.port("only", None)).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let console = device.as_console().unwrap();

    let first = console.ports().unwrap();
    let calls_after_first = h.memory.calls();
    let second = console.ports().unwrap();
    assert!(std::ptr::eq(first, second));
    assert_eq!(h.memory.calls(), calls_after_first);
    assert_eq!(h.memory.calls_to("device_maximum_port_count"), 1);
    assert_eq!(h.memory.calls_to("port_at_index"), 3);
}

#[test]
fn concurrent_first_discovery_queries_once() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.set_maximum_port_count(2).unwrap();
    device.place_port(0, h.port("a", None)).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let console = device.as_console().unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| assert_eq!(console.ports().unwrap().len(), 2));
        }
    });
    assert_eq!(h.memory.calls_to("device_maximum_port_count"), 1);
}

#[test]
fn unclassifiable_attachment_comes_back_unresolved() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", None)).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();

    let bridge = h.memory.foreign_attachment("NetworkSerialBridge", Some(serde_json::json!({"host": "10.0.0.2"})));
    h.memory.replace_attachment_externally(port.handle(), Some(bridge)).unwrap();
    assert_eq!(port.live().unwrap(), Some(Attachment::Unresolved(bridge)));

    let opaque = h.memory.foreign_attachment("Opaque", None);
    h.memory.replace_attachment_externally(port.handle(), Some(opaque)).unwrap();
    assert_eq!(port.live().unwrap(), Some(Attachment::Unresolved(opaque)));

    // an unresolved attachment can be offered back as-is
    port.rebind(Some(Attachment::Unresolved(bridge))).unwrap();
    assert_eq!(port.live().unwrap(), Some(Attachment::Unresolved(bridge)));
    assert!(!h.memory.is_released(bridge));
}

#[test]
fn attachment_the_engine_cannot_inspect_is_unresolved() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", None)).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();
    port.rebind(Some(Attachment::file("a", false))).unwrap();

    // the engine points the port at an object that is not an attachment
    let stray = device.handle();
    h.memory.replace_attachment_externally(port.handle(), Some(stray)).unwrap();
    assert_eq!(port.live().unwrap(), Some(Attachment::Unresolved(stray)));
    assert_eq!(port.cached(), Some(Attachment::Unresolved(stray)));
}

#[test]
fn freed_attachment_cannot_be_offered_back() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", None)).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();

    let opaque = h.memory.foreign_attachment("Opaque", None);
    h.memory.replace_attachment_externally(port.handle(), Some(opaque)).unwrap();
    assert_eq!(port.live().unwrap(), Some(Attachment::Unresolved(opaque)));

    port.rebind(Some(Attachment::file("a", false))).unwrap();
    let created = h.memory.port_attachment(port.handle()).unwrap().unwrap();
    port.rebind(None).unwrap();
    // the attachment created for the rebind was released and is now unreferenced
    assert!(!h.memory.is_live(created));
    assert!(matches!(
        port.rebind(Some(Attachment::Unresolved(created))),
        Err(ConsoleError::InvalidHandle(freed)) if freed == created
    ));
    assert_eq!(port.cached(), None);

    // a foreign object was never released, so it survives being detached
    port.rebind(Some(Attachment::Unresolved(opaque))).unwrap();
    assert_eq!(port.live().unwrap(), Some(Attachment::Unresolved(opaque)));
}

#[test]
fn teardown_invalidates_runtime_objects() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.place_port(0, h.port("serial", Some(Attachment::file("x", false)))).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let port = device.as_console().unwrap().port(0).unwrap().unwrap();
    port.live().unwrap();
    let unqueried = h.single_console(machine);

    h.memory.stop(machine).unwrap();
    let signal = h.memory.state_changed_signal(machine).unwrap();
    assert_eq!(signal.read().unwrap(), 1);
    assert!(!h.memory.is_running(machine));

    assert!(matches!(port.name(), Err(ConsoleError::InvalidHandle(p)) if p == port.handle()));
    assert!(matches!(port.live(), Err(ConsoleError::InvalidHandle(_))));
    assert!(matches!(port.rebind(None), Err(ConsoleError::InvalidHandle(_))));
    assert!(matches!(discover(&h.engine, machine), Err(ConsoleError::InvalidHandle(m)) if m == machine));
    // the failed calls did not disturb the cache
    assert_eq!(port.cached(), Some(Attachment::file("x", false)));

    // slots discovered before teardown stay memoized; a device never queried cannot discover them now
    let console = device.as_console().unwrap();
    let calls = h.memory.calls();
    assert_eq!(console.maximum_port_count().unwrap(), 16);
    assert_eq!(console.port(0).unwrap().map(|p| p.handle()), Some(port.handle()));
    assert_eq!(h.memory.calls(), calls);
    assert!(matches!(unqueried.as_console().unwrap().ports(), Err(ConsoleError::InvalidHandle(_))));
}

#[test]
fn port_events_carry_slot_index() {
    let h = Harness::new();
    let mut device = DeviceConfiguration::new(h.engine.clone()).unwrap();
    device.set_maximum_port_count(4).unwrap();
    device.place_port(3, h.port("agent", Some(Attachment::clipboard_agent(true)))).unwrap();
    let machine = h.start(vec![device]);
    let device = h.single_console(machine);
    let console = device.as_console().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    console.on_port_events(move |event| sink.lock().unwrap().push(event)).unwrap();

    h.memory.emit_port_event(console.handle(), 3, PortEventKind::Opened).unwrap();
    h.memory.emit_port_event(console.handle(), 3, PortEventKind::Closed).unwrap();
    assert!(h.memory.emit_port_event(console.handle(), 1, PortEventKind::Opened).is_err());

    assert_eq!(
        *seen.lock().unwrap(),
        vec![PortEvent::Opened { index: 3 }, PortEvent::Closed { index: 3 }]
    );
}

#[test]
fn spice_agent_port_name_is_stable() {
    let h = Harness::new();
    let first = spice_agent_port_name(h.engine.as_ref()).unwrap();
    assert_eq!(first, "com.redhat.spice.0");
    assert_eq!(spice_agent_port_name(h.engine.as_ref()).unwrap(), first);
}

#[test]
fn multiple_devices_keep_engine_order() {
    let h = Harness::new();
    let mut first = DeviceConfiguration::new(h.engine.clone()).unwrap();
    first.set_maximum_port_count(1).unwrap();
    first.place_port(0, h.port("first", None)).unwrap();
    let mut second = DeviceConfiguration::new(h.engine.clone()).unwrap();
    second.set_maximum_port_count(2).unwrap();
    second.place_port(1, h.port("second", None)).unwrap();
    let machine = h.start(vec![first, second]);

    let devices = discover(&h.engine, machine).unwrap();
    assert_eq!(devices.len(), 2);
    let a = devices[0].as_console().unwrap();
    let b = devices[1].as_console().unwrap();
    assert_eq!(a.port(0).unwrap().unwrap().name().unwrap(), "first");
    assert_eq!(b.maximum_port_count().unwrap(), 2);
    assert_eq!(b.port(1).unwrap().unwrap().name().unwrap(), "second");
}
