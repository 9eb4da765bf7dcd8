//! Registry lifecycle integration tests: creation, autoprobe, cascading
//! deletion, and hook ordering, driven through the mock back-end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dmx_core::error::DmxError;
use dmx_core::hooks::{DriverHooks, InterfaceHooks, InterfaceSpec};
use dmx_core::property::{Property, PropertyList, PropertyValue};
use dmx_core::universe::{Direction, Universe};
use dmx_driver_mock::{Event, EventLog, MockDriver, MockFamilyHooks};
use dmx_hardware::{DmxRegistry, Driver, Interface};

fn mock_family(
    registry: &DmxRegistry,
    log: &Arc<EventLog>,
) -> (Arc<dmx_hardware::Family>, Arc<Driver>) {
    let family = registry
        .create_family("stage", MockFamilyHooks::shared(log))
        .unwrap();
    let driver = registry
        .register_driver(
            &family,
            "usbdmx",
            Arc::new(
                MockDriver::new()
                    .with_universes(vec![Direction::Output, Direction::Input])
                    .with_events(log),
            ),
        )
        .unwrap();
    (family, driver)
}

/// Non-cascading deletion fails iff a driver remains, with zero
/// observable side effects on failure.
#[test]
fn delete_family_without_cascade_fails_fast() {
    let log = Arc::new(EventLog::default());
    let registry = DmxRegistry::new();
    let (family, driver) = mock_family(&registry, &log);
    let interface = registry
        .create_interface(&driver, PropertyList::new())
        .unwrap();

    let err = registry.delete_family("stage", false).unwrap_err();
    assert!(matches!(err, DmxError::HasActiveChildren("family")));

    // Fully intact: still registered, children untouched, no hook ran.
    assert!(registry.find_family("stage").is_ok());
    assert!(family.is_available());
    assert_eq!(family.driver_count(), 1);
    assert_eq!(driver.interface_count(), 1);
    assert!(interface.is_available());
    assert!(log.events().is_empty());

    // Drained, the same call succeeds.
    registry.delete_interface(&driver, &interface).unwrap();
    registry.delete_driver(&family, &driver, false).unwrap();
    registry.delete_family("stage", false).unwrap();
    assert!(matches!(
        registry.find_family("stage"),
        Err(DmxError::NotFound(_))
    ));
}

/// After a cascade, lookup fails and every universe once reachable had
/// its deletion hook invoked exactly once, ahead of the coarser hooks.
#[test]
fn cascade_releases_every_universe_exactly_once() {
    let log = Arc::new(EventLog::default());
    let registry = DmxRegistry::new();
    let (_family, driver) = mock_family(&registry, &log);

    let first = registry
        .create_interface(&driver, PropertyList::new())
        .unwrap();
    let second = registry
        .create_interface(&driver, PropertyList::new())
        .unwrap();
    let universes: Vec<_> = first
        .universes()
        .into_iter()
        .chain(second.universes())
        .collect();
    assert_eq!(universes.len(), 4);

    registry.delete_family("stage", true).unwrap();
    assert!(matches!(
        registry.find_family("stage"),
        Err(DmxError::NotFound(_))
    ));

    for universe in &universes {
        assert!(!universe.is_available());
        assert_eq!(log.universe_released_count(universe.id()), 1);
    }

    // Teardown order: all universe hooks before the family hook, each
    // interface's universes before its teardown, driver before family.
    let events = log.events();
    assert_eq!(events.last(), Some(&Event::FamilyReleased));
    assert_eq!(events[events.len() - 2], Event::DriverReleased);
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == Event::InterfaceTeardown)
            .count(),
        2
    );
    assert_eq!(log.universes_released(), 4);
}

/// Create-then-delete restores the driver's interface count.
#[test]
fn interface_create_delete_is_balanced() {
    let log = Arc::new(EventLog::default());
    let registry = DmxRegistry::new();
    let (_family, driver) = mock_family(&registry, &log);

    let before = driver.interface_count();
    let interface = registry
        .create_interface(&driver, PropertyList::new())
        .unwrap();
    assert_eq!(driver.interface_count(), before + 1);

    registry.delete_interface(&driver, &interface).unwrap();
    assert_eq!(driver.interface_count(), before);
    assert_eq!(log.universes_released(), 2);
    assert_eq!(log.events().last(), Some(&Event::InterfaceTeardown));
}

#[test]
fn autoprobe_picks_highest_score() {
    let log = Arc::new(EventLog::default());
    let registry = DmxRegistry::new();
    let family = registry
        .create_family("stage", MockFamilyHooks::shared(&log))
        .unwrap();
    let weak = registry
        .register_driver(
            &family,
            "generic",
            Arc::new(MockDriver::new().with_probe("usbdmx2", 1).with_events(&log)),
        )
        .unwrap();
    let strong = registry
        .register_driver(
            &family,
            "usbdmx2",
            Arc::new(MockDriver::new().with_probe("usbdmx2", 10).with_events(&log)),
        )
        .unwrap();

    let props = PropertyList::new();
    props
        .add(Property::stored(
            "model",
            PropertyValue::String("usbdmx2".into()),
        ))
        .unwrap();

    let interface = registry.family_create_interface(&family, props).unwrap();
    assert_eq!(interface.driver(), strong.id());
    assert_eq!(strong.interface_count(), 1);
    assert_eq!(weak.interface_count(), 0);
}

/// Ownership of the request properties transfers fully to the framework:
/// the failure path discards them, the success path stores them on the
/// interface.
#[test]
fn autoprobe_failure_discards_properties() {
    let log = Arc::new(EventLog::default());
    let registry = DmxRegistry::new();
    let family = registry
        .create_family("stage", MockFamilyHooks::shared(&log))
        .unwrap();
    registry
        .register_driver(
            &family,
            "usbdmx",
            Arc::new(MockDriver::new().with_probe("usbdmx2", 1).with_events(&log)),
        )
        .unwrap();

    let marker = Property::stored("model", PropertyValue::String("unknown".into()));
    let props = PropertyList::new();
    props.add(marker.clone()).unwrap();

    let err = registry.family_create_interface(&family, props).unwrap_err();
    assert!(matches!(err, DmxError::NotFound(_)));
    // The list was dropped by the failure path; only our handle remains.
    assert_eq!(Arc::strong_count(&marker), 1);

    // Success path: the interface owns the list.
    let marker = Property::stored("model", PropertyValue::String("usbdmx2".into()));
    let props = PropertyList::new();
    props.add(marker.clone()).unwrap();
    let interface = registry.family_create_interface(&family, props).unwrap();
    assert_eq!(Arc::strong_count(&marker), 2);
    assert_eq!(
        interface.properties().get("model").map(|p| p.get()),
        Some(PropertyValue::String("usbdmx2".into()))
    );
}

/// A failing initialization hook leaves nothing reachable from the driver.
#[test]
fn failed_init_is_never_visible() {
    let log = Arc::new(EventLog::default());
    let registry = DmxRegistry::new();
    let (_family, driver) = mock_family(&registry, &log);

    let props = PropertyList::new();
    props
        .add(Property::stored("fail_init", PropertyValue::Bool(true)))
        .unwrap();

    let err = registry.create_interface(&driver, props).unwrap_err();
    assert!(matches!(err, DmxError::InitFailed(_)));
    assert_eq!(driver.interface_count(), 0);
    assert!(log.events().is_empty());
}

#[test]
fn delete_driver_mirrors_family_semantics() {
    let log = Arc::new(EventLog::default());
    let registry = DmxRegistry::new();
    let (family, driver) = mock_family(&registry, &log);
    let interface = registry
        .create_interface(&driver, PropertyList::new())
        .unwrap();

    let err = registry.delete_driver(&family, &driver, false).unwrap_err();
    assert!(matches!(err, DmxError::HasActiveChildren("driver")));
    assert_eq!(family.driver_count(), 1);
    assert!(interface.is_available());

    registry.delete_driver(&family, &driver, true).unwrap();
    assert_eq!(family.driver_count(), 0);
    assert!(!interface.is_available());
    assert_eq!(log.universes_released(), 2);
    assert_eq!(log.events().last(), Some(&Event::DriverReleased));
}

// =============================================================================
// Re-entrant deletion
// =============================================================================

/// Interface hooks whose teardown re-enters `delete_interface` on the same
/// interface, as a misbehaved back-end might.
#[derive(Default)]
struct ReentrantHooks {
    target: Mutex<Option<(Arc<DmxRegistry>, Arc<Driver>, Arc<Interface>)>>,
    universes_released: AtomicUsize,
    teardowns: AtomicUsize,
}

impl InterfaceHooks for ReentrantHooks {
    fn universe_released(&self, _universe: &Universe) {
        self.universes_released.fetch_add(1, Ordering::SeqCst);
    }

    fn teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if let Some((registry, driver, interface)) = self.target.lock().take() {
            registry.delete_interface(&driver, &interface).unwrap();
        }
    }
}

struct ReentrantDriver {
    hooks: Arc<ReentrantHooks>,
}

impl DriverHooks for ReentrantDriver {
    fn create_interface(&self, _properties: &PropertyList) -> dmx_core::Result<InterfaceSpec> {
        Ok(InterfaceSpec {
            universes: vec![Direction::Output],
            max_universes: 1,
            hooks: self.hooks.clone(),
        })
    }
}

#[test]
fn reentrant_deletion_from_teardown_is_tolerated() {
    let hooks = Arc::new(ReentrantHooks::default());
    let registry = Arc::new(DmxRegistry::new());
    let family = registry.create_family("stage", Arc::new(())).unwrap();
    let driver = registry
        .register_driver(
            &family,
            "reentrant",
            Arc::new(ReentrantDriver {
                hooks: hooks.clone(),
            }),
        )
        .unwrap();
    let interface = registry
        .create_interface(&driver, PropertyList::new())
        .unwrap();
    *hooks.target.lock() = Some((registry.clone(), driver.clone(), interface.clone()));

    registry.delete_interface(&driver, &interface).unwrap();

    // The re-entrant call was absorbed: each hook ran exactly once.
    assert_eq!(hooks.universes_released.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(driver.interface_count(), 0);
}

/// Name uniqueness holds over a longer create/delete sequence.
#[test]
fn registry_never_holds_duplicate_family_names() {
    let registry = DmxRegistry::new();
    for round in 0..3 {
        for name in ["alpha", "beta", "gamma"] {
            registry.create_family(name, Arc::new(())).unwrap();
            assert!(matches!(
                registry.create_family(name, Arc::new(())),
                Err(DmxError::DuplicateName(_))
            ));
        }
        assert_eq!(registry.families().len(), 3, "round {round}");
        for name in ["alpha", "beta", "gamma"] {
            registry.delete_family(name, false).unwrap();
        }
        assert!(registry.families().is_empty());
    }
}
