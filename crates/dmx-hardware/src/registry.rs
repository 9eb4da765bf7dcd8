//! Registry for runtime back-end composition.
//!
//! The registry owns the whole object tree:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DmxRegistry                          │
//! │  families: DashMap<name, Arc<Family>>                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Family "stage"                                             │
//! │  drivers: BTreeMap<DriverId, Arc<Driver>>                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Driver "usbdmx"                                            │
//! │  interfaces: BTreeMap<InterfaceId, Arc<Interface>>          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Interface                                                  │
//! │  universes: BTreeMap<UniverseId, Arc<Universe>> (≤ max)     │
//! │  properties: PropertyList                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ownership is strictly downward: parents own children in id-keyed ordered
//! maps; children carry only the parent's id, never a back link. Removal is
//! therefore position-independent, and every collection is guarded by its
//! own lock held only across the structural mutation.
//!
//! Deletion ordering is detach-before-cascade: an owner is unlinked from its
//! parent collection (making new lookups and bindings fail) before any child
//! is torn down, so a lookup never observes a partially-unlinked object and
//! a fresh wake-up never races freed state.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use dmx_core::error::{DmxError, Result};
use dmx_core::hooks::{DriverHooks, FamilyHooks, InterfaceHooks};
use dmx_core::property::PropertyList;
use dmx_core::universe::{Direction, Universe, UniverseId};
use dmx_core::FAMILY_NAME_MAX;

/// Unique identifier of a family within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FamilyId(pub u64);

/// Unique identifier of a driver within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverId(pub u64);

/// Unique identifier of an interface within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub u64);

/// A named registry of related drivers (one vendor's set of back-ends).
pub struct Family {
    id: FamilyId,
    name: String,
    hooks: Arc<dyn FamilyHooks>,
    drivers: RwLock<BTreeMap<DriverId, Arc<Driver>>>,
    available: AtomicBool,
}

impl std::fmt::Debug for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Family")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("available", &self.is_available())
            .finish()
    }
}

impl Family {
    /// Identifier within the registry.
    pub fn id(&self) -> FamilyId {
        self.id
    }

    /// Registered name, unique in the registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the family still accepts new drivers.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Number of registered drivers.
    pub fn driver_count(&self) -> usize {
        self.drivers.read().len()
    }

    /// Drivers in registration order.
    pub fn drivers(&self) -> Vec<Arc<Driver>> {
        self.drivers.read().values().cloned().collect()
    }

    /// Look up a driver by name.
    pub fn find_driver(&self, name: &str) -> Result<Arc<Driver>> {
        self.drivers
            .read()
            .values()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| DmxError::NotFound(format!("driver '{name}'")))
    }
}

/// A back-end capable of producing interfaces for one device class.
pub struct Driver {
    id: DriverId,
    name: String,
    family: FamilyId,
    hooks: Arc<dyn DriverHooks>,
    interfaces: RwLock<BTreeMap<InterfaceId, Arc<Interface>>>,
    available: AtomicBool,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("family", &self.family)
            .field("available", &self.is_available())
            .finish()
    }
}

impl Driver {
    /// Identifier within the registry.
    pub fn id(&self) -> DriverId {
        self.id
    }

    /// Registered name, unique within the owning family.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the owning family; a driver belongs to exactly one family for
    /// its whole life.
    pub fn family(&self) -> FamilyId {
        self.family
    }

    /// Whether the driver still accepts new interfaces.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Number of active interfaces.
    pub fn interface_count(&self) -> usize {
        self.interfaces.read().len()
    }

    /// Active interfaces in creation order.
    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.interfaces.read().values().cloned().collect()
    }
}

/// One active device instance, owning universes and configuration
/// properties.
pub struct Interface {
    id: InterfaceId,
    driver: DriverId,
    hooks: Arc<dyn InterfaceHooks>,
    properties: PropertyList,
    max_universes: usize,
    universes: RwLock<BTreeMap<UniverseId, Arc<Universe>>>,
    available: AtomicBool,
    /// Latched by the first deletion; re-entrant deletes become no-ops.
    deleting: AtomicBool,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .field("available", &self.is_available())
            .finish()
    }
}

impl Interface {
    /// Identifier within the registry.
    pub fn id(&self) -> InterfaceId {
        self.id
    }

    /// Id of the owning driver.
    pub fn driver(&self) -> DriverId {
        self.driver
    }

    /// Whether the interface still accepts new universes.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Configuration properties owned by this interface.
    pub fn properties(&self) -> &PropertyList {
        &self.properties
    }

    /// Upper bound on the universe count.
    pub fn max_universes(&self) -> usize {
        self.max_universes
    }

    /// Number of owned universes; never exceeds
    /// [`Interface::max_universes`].
    pub fn universe_count(&self) -> usize {
        self.universes.read().len()
    }

    /// Owned universes in creation order.
    pub fn universes(&self) -> Vec<Arc<Universe>> {
        self.universes.read().values().cloned().collect()
    }
}

/// Process-wide composition root: owns every family and, transitively, the
/// whole Driver → Interface → Universe tree.
///
/// The registry is empty at construction and must be drained (via
/// [`DmxRegistry::shutdown`] or explicit family deletion) before process
/// teardown.
pub struct DmxRegistry {
    families: DashMap<String, Arc<Family>>,
    next_id: AtomicU64,
}

impl Default for DmxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DmxRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            families: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Families
    // =========================================================================

    /// Register a family under a unique name (non-empty, at most
    /// [`FAMILY_NAME_MAX`] characters).
    pub fn create_family(
        &self,
        name: &str,
        hooks: Arc<dyn FamilyHooks>,
    ) -> Result<Arc<Family>> {
        if name.is_empty() {
            return Err(DmxError::InvalidName {
                name: name.to_string(),
                reason: "family name must not be empty",
            });
        }
        if name.chars().count() > FAMILY_NAME_MAX {
            return Err(DmxError::InvalidName {
                name: name.to_string(),
                reason: "family name exceeds 31 characters",
            });
        }

        match self.families.entry(name.to_string()) {
            Entry::Occupied(_) => Err(DmxError::DuplicateName(name.to_string())),
            Entry::Vacant(slot) => {
                let family = Arc::new(Family {
                    id: FamilyId(self.next_id()),
                    name: name.to_string(),
                    hooks,
                    drivers: RwLock::new(BTreeMap::new()),
                    available: AtomicBool::new(true),
                });
                slot.insert(family.clone());
                info!(family = name, "family registered");
                Ok(family)
            }
        }
    }

    /// Look up a family by name.
    pub fn find_family(&self, name: &str) -> Result<Arc<Family>> {
        self.families
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DmxError::NotFound(format!("family '{name}'")))
    }

    /// Registered families, in no particular order.
    pub fn families(&self) -> Vec<Arc<Family>> {
        self.families.iter().map(|e| e.value().clone()).collect()
    }

    /// Delete a family.
    ///
    /// With `cascade = false` the call fails with
    /// [`DmxError::HasActiveChildren`] if any driver remains, with zero side
    /// effects: the family stays registered and untouched. With
    /// `cascade = true` the family is detached from the registry first (no
    /// new lookup can find it mid-teardown), then every driver is deleted,
    /// then the family's released hook fires; this path cannot partially
    /// fail.
    pub fn delete_family(&self, name: &str, cascade: bool) -> Result<()> {
        if cascade {
            let (_, family) = self
                .families
                .remove(name)
                .ok_or_else(|| DmxError::NotFound(format!("family '{name}'")))?;
            self.teardown_family(&family);
            return Ok(());
        }

        // Atomic check-and-detach: the shard lock covers both the child
        // check and the removal, so a concurrent driver registration cannot
        // slip between them.
        match self
            .families
            .remove_if(name, |_, family| family.drivers.read().is_empty())
        {
            Some((_, family)) => {
                family.available.store(false, Ordering::Release);
                family.hooks.released();
                info!(family = name, "family deleted");
                Ok(())
            }
            None if self.families.contains_key(name) => {
                Err(DmxError::HasActiveChildren("family"))
            }
            None => Err(DmxError::NotFound(format!("family '{name}'"))),
        }
    }

    fn teardown_family(&self, family: &Arc<Family>) {
        family.available.store(false, Ordering::Release);
        let drivers = mem::take(&mut *family.drivers.write());
        for driver in drivers.into_values() {
            self.teardown_driver(&driver);
        }
        family.hooks.released();
        info!(family = family.name(), "family deleted (cascade)");
    }

    /// Cascade-delete every remaining family. Required before process
    /// teardown.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.families.iter().map(|e| e.key().clone()).collect();
        if !names.is_empty() {
            warn!(remaining = names.len(), "registry shutdown draining families");
        }
        for name in names {
            // A concurrent explicit delete may have won the race.
            let _ = self.delete_family(&name, true);
        }
    }

    // =========================================================================
    // Drivers
    // =========================================================================

    /// Register a driver with a family. Driver names are unique within
    /// their family; a family being deleted accepts no new drivers
    /// ([`DmxError::NotAvailable`]).
    pub fn register_driver(
        &self,
        family: &Arc<Family>,
        name: &str,
        hooks: Arc<dyn DriverHooks>,
    ) -> Result<Arc<Driver>> {
        let mut drivers = family.drivers.write();
        // Cascade marks the family unavailable before draining under this
        // same lock, so the re-check under the lock is authoritative.
        if !family.is_available() {
            return Err(DmxError::NotAvailable);
        }
        if drivers.values().any(|d| d.name() == name) {
            return Err(DmxError::DuplicateName(name.to_string()));
        }
        let driver = Arc::new(Driver {
            id: DriverId(self.next_id()),
            name: name.to_string(),
            family: family.id(),
            hooks,
            interfaces: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        });
        drivers.insert(driver.id(), driver.clone());
        drop(drivers);
        info!(family = family.name(), driver = name, "driver registered");
        Ok(driver)
    }

    /// Delete a driver from its family, mirroring family deletion semantics
    /// one level down: non-cascading deletion fails fast with intact state
    /// if interfaces remain; cascading deletion detaches first and cannot
    /// partially fail.
    pub fn delete_driver(
        &self,
        family: &Arc<Family>,
        driver: &Arc<Driver>,
        cascade: bool,
    ) -> Result<()> {
        if driver.family() != family.id() {
            return Err(DmxError::NotFound(format!("driver '{}'", driver.name())));
        }

        let detached = {
            let mut drivers = family.drivers.write();
            if !drivers.contains_key(&driver.id()) {
                return Err(DmxError::NotFound(format!("driver '{}'", driver.name())));
            }
            if !cascade && !driver.interfaces.read().is_empty() {
                return Err(DmxError::HasActiveChildren("driver"));
            }
            drivers.remove(&driver.id())
        };

        if let Some(driver) = detached {
            self.teardown_driver(&driver);
        }
        Ok(())
    }

    fn teardown_driver(&self, driver: &Arc<Driver>) {
        driver.available.store(false, Ordering::Release);
        let interfaces = mem::take(&mut *driver.interfaces.write());
        for interface in interfaces.into_values() {
            self.teardown_interface(&interface);
        }
        driver.hooks.released();
        debug!(driver = driver.name(), "driver deleted");
    }

    // =========================================================================
    // Interfaces & universes
    // =========================================================================

    /// Create a new interface on `driver`.
    ///
    /// The driver's initialization hook runs before the interface is linked
    /// into the driver's interface set, so a half-initialized interface is
    /// never externally visible. Ownership of `properties` transfers fully
    /// to the framework: the interface owns it on success, every failure
    /// path discards it.
    pub fn create_interface(
        &self,
        driver: &Arc<Driver>,
        properties: PropertyList,
    ) -> Result<Arc<Interface>> {
        if !driver.is_available() {
            return Err(DmxError::NotAvailable);
        }

        let spec = driver.hooks.create_interface(&properties)?;
        if spec.universes.len() > spec.max_universes {
            return Err(DmxError::InitFailed(format!(
                "driver '{}' declared {} universes with a limit of {}",
                driver.name(),
                spec.universes.len(),
                spec.max_universes
            )));
        }

        let mut universes = BTreeMap::new();
        for direction in spec.universes {
            let id = UniverseId(self.next_id());
            universes.insert(id, Universe::new(id, direction));
        }
        let interface = Arc::new(Interface {
            id: InterfaceId(self.next_id()),
            driver: driver.id(),
            hooks: spec.hooks,
            properties,
            max_universes: spec.max_universes,
            universes: RwLock::new(universes),
            available: AtomicBool::new(true),
            deleting: AtomicBool::new(false),
        });

        {
            let mut interfaces = driver.interfaces.write();
            if !driver.is_available() {
                // The driver started cascading between the hook and the
                // link; unwind the never-visible interface through the
                // normal teardown path so hook-side state is not leaked.
                drop(interfaces);
                self.teardown_interface(&interface);
                return Err(DmxError::NotAvailable);
            }
            interfaces.insert(interface.id(), interface.clone());
        }
        info!(
            driver = driver.name(),
            universes = interface.universe_count(),
            "interface created"
        );
        Ok(interface)
    }

    /// Create an interface through the family: every driver's autoprobe
    /// hook scores `properties`, the best match (earliest registered on a
    /// tie) creates the interface. Fails with [`DmxError::NotFound`] if no
    /// driver matches; `properties` is owned by the framework on every path
    /// and discarded on failure.
    pub fn family_create_interface(
        &self,
        family: &Arc<Family>,
        properties: PropertyList,
    ) -> Result<Arc<Interface>> {
        if !family.is_available() {
            return Err(DmxError::NotAvailable);
        }

        // Probe outside the collection lock; hooks are back-end code.
        let candidates = family.drivers();
        let mut best: Option<(u32, Arc<Driver>)> = None;
        for driver in &candidates {
            if let Some(score) = driver.hooks.autoprobe(&properties) {
                if best.as_ref().map_or(true, |(top, _)| score > *top) {
                    best = Some((score, driver.clone()));
                }
            }
        }
        match best {
            Some((score, driver)) => {
                debug!(
                    family = family.name(),
                    driver = driver.name(),
                    score,
                    "autoprobe selected driver"
                );
                self.create_interface(&driver, properties)
            }
            None => Err(DmxError::NotFound(format!(
                "no driver in family '{}' matched the request",
                family.name()
            ))),
        }
    }

    /// Add a universe to an existing interface. Fails with
    /// [`DmxError::OutOfMemory`] when the interface is at its universe
    /// limit; `current ≤ max` holds at all times.
    pub fn create_universe(
        &self,
        interface: &Arc<Interface>,
        direction: Direction,
    ) -> Result<Arc<Universe>> {
        let mut universes = interface.universes.write();
        if !interface.is_available() {
            return Err(DmxError::NotAvailable);
        }
        if universes.len() >= interface.max_universes {
            return Err(DmxError::OutOfMemory("universe limit reached"));
        }
        let id = UniverseId(self.next_id());
        let universe = Universe::new(id, direction);
        universes.insert(id, universe.clone());
        Ok(universe)
    }

    /// Delete an interface: detach it from `driver`'s interface set, retire
    /// and release every owned universe, then run the teardown hook.
    ///
    /// Tolerates re-entrant deletion triggered by the teardown hook itself:
    /// the second call finds the interface already latched and returns
    /// without side effects.
    pub fn delete_interface(
        &self,
        driver: &Arc<Driver>,
        interface: &Arc<Interface>,
    ) -> Result<()> {
        if interface.driver() != driver.id() {
            return Err(DmxError::NotFound("interface".to_string()));
        }
        driver.interfaces.write().remove(&interface.id());
        self.teardown_interface(interface);
        Ok(())
    }

    fn teardown_interface(&self, interface: &Arc<Interface>) {
        if interface.deleting.swap(true, Ordering::AcqRel) {
            // Re-entrant or concurrent delete; the first caller finishes the
            // teardown.
            return;
        }
        interface.available.store(false, Ordering::Release);
        let universes = mem::take(&mut *interface.universes.write());
        for universe in universes.into_values() {
            // Retire before the hook: blocked sessions wake with the Closed
            // outcome and no new binding can observe the dying universe.
            universe.retire();
            interface.hooks.universe_released(&universe);
        }
        interface.hooks.teardown();
        debug!(interface = interface.id().0, "interface deleted");
    }
}
