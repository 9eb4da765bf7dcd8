//! Mock DMX back-end for tests and simulation.
//!
//! [`MockDriver`] implements the back-end hook traits with a configurable
//! universe layout and autoprobe behavior, and every mock hook records its
//! lifecycle invocations into a shared [`EventLog`] so tests can assert
//! teardown ordering and exactly-once semantics.
//!
//! # Example
//!
//! ```rust,ignore
//! let log = Arc::new(EventLog::default());
//! let registry = DmxRegistry::new();
//! let family = registry.create_family("stage", MockFamilyHooks::shared(&log))?;
//! let driver = registry.register_driver(
//!     &family,
//!     "usbdmx",
//!     Arc::new(MockDriver::new().with_universes(vec![Direction::Output]).with_events(&log)),
//! )?;
//! let interface = registry.create_interface(&driver, PropertyList::new())?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use dmx_core::error::{DmxError, Result};
use dmx_core::hooks::{DriverHooks, FamilyHooks, InterfaceHooks, InterfaceSpec};
use dmx_core::property::{PropertyList, PropertyValue};
use dmx_core::universe::{Direction, Universe, UniverseId};

/// A recorded lifecycle invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `InterfaceHooks::universe_released` for the given universe.
    UniverseReleased(UniverseId),
    /// `InterfaceHooks::teardown`.
    InterfaceTeardown,
    /// `DriverHooks::released`.
    DriverReleased,
    /// `FamilyHooks::released`.
    FamilyReleased,
}

/// Shared recorder of hook invocations, in call order.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    fn record(&self, event: Event) {
        debug!(?event, "mock hook invoked");
        self.events.lock().push(event);
    }

    /// Everything recorded so far, in call order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// How many times the deletion hook ran for `universe`.
    pub fn universe_released_count(&self, universe: UniverseId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == Event::UniverseReleased(universe))
            .count()
    }

    /// Total universe deletion hook invocations.
    pub fn universes_released(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::UniverseReleased(_)))
            .count()
    }
}

/// Family hooks recording into an [`EventLog`].
pub struct MockFamilyHooks {
    events: Arc<EventLog>,
}

impl MockFamilyHooks {
    /// Hooks recording into `log`.
    pub fn shared(log: &Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            events: log.clone(),
        })
    }
}

impl FamilyHooks for MockFamilyHooks {
    fn released(&self) {
        self.events.record(Event::FamilyReleased);
    }
}

/// Interface hooks recording into an [`EventLog`].
pub struct MockInterfaceHooks {
    events: Arc<EventLog>,
}

impl InterfaceHooks for MockInterfaceHooks {
    fn universe_released(&self, universe: &Universe) {
        self.events.record(Event::UniverseReleased(universe.id()));
    }

    fn teardown(&self) {
        self.events.record(Event::InterfaceTeardown);
    }
}

/// Configurable mock back-end driver.
pub struct MockDriver {
    /// Universe layout of every interface this driver creates.
    universes: Vec<Direction>,
    max_universes: usize,
    /// Autoprobe matches when the request's `model` property equals this.
    probe_model: Option<String>,
    probe_score: u32,
    events: Arc<EventLog>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Driver producing one output universe per interface, no autoprobe.
    pub fn new() -> Self {
        Self {
            universes: vec![Direction::Output],
            max_universes: 8,
            probe_model: None,
            probe_score: 0,
            events: Arc::new(EventLog::default()),
        }
    }

    /// Universe layout for created interfaces.
    pub fn with_universes(mut self, universes: Vec<Direction>) -> Self {
        self.universes = universes;
        self
    }

    /// Universe limit for created interfaces.
    pub fn with_max_universes(mut self, max: usize) -> Self {
        self.max_universes = max;
        self
    }

    /// Answer autoprobe with `score` when the request carries a `model`
    /// string property equal to `model`.
    pub fn with_probe(mut self, model: impl Into<String>, score: u32) -> Self {
        self.probe_model = Some(model.into());
        self.probe_score = score;
        self
    }

    /// Record lifecycle events into `log`.
    pub fn with_events(mut self, log: &Arc<EventLog>) -> Self {
        self.events = log.clone();
        self
    }
}

impl DriverHooks for MockDriver {
    fn autoprobe(&self, properties: &PropertyList) -> Option<u32> {
        let wanted = self.probe_model.as_deref()?;
        match properties.get("model").map(|p| p.get()) {
            Some(PropertyValue::String(model)) if model == wanted => Some(self.probe_score),
            _ => None,
        }
    }

    fn create_interface(&self, properties: &PropertyList) -> Result<InterfaceSpec> {
        // A `fail_init` flag simulates a back-end whose hardware probe
        // fails after the request reached the driver.
        if let Some(PropertyValue::Bool(true)) = properties.get("fail_init").map(|p| p.get()) {
            return Err(DmxError::InitFailed("mock induced failure".into()));
        }
        Ok(InterfaceSpec {
            universes: self.universes.clone(),
            max_universes: self.max_universes,
            hooks: Arc::new(MockInterfaceHooks {
                events: self.events.clone(),
            }),
        })
    }

    fn released(&self) {
        self.events.record(Event::DriverReleased);
    }
}
