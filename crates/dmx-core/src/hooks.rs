//! Back-end hook traits.
//!
//! A back-end plugs into the registry through one polymorphic hook object
//! per role, supplied at registration time and invoked synchronously by the
//! registry. Required lifecycle hooks are methods without default bodies, so
//! a back-end that forgets one fails to compile instead of failing at
//! teardown.
//!
//! Hooks must not re-enter registry mutation except through the
//! detach-before-cascade ordering: by the time a deletion hook runs, its
//! object is already unlinked from the parent collection, so a re-entrant
//! deletion of the same object is an idempotent no-op.

use std::sync::Arc;

use crate::error::Result;
use crate::property::PropertyList;
use crate::universe::{Direction, Universe};

/// Hooks carried by a registered family.
pub trait FamilyHooks: Send + Sync {
    /// Called once after the family has been detached from the registry and
    /// all of its drivers torn down.
    fn released(&self) {}
}

/// A family with no back-end state.
impl FamilyHooks for () {}

/// Hooks carried by a registered driver; the factory for its interfaces.
pub trait DriverHooks: Send + Sync {
    /// Score how well this driver matches a consumer request described by
    /// `properties`. `None` means no match. Used by
    /// family-level interface creation to select the best driver; ties go
    /// to the earlier-registered driver.
    fn autoprobe(&self, properties: &PropertyList) -> Option<u32> {
        let _ = properties;
        None
    }

    /// Driver-specific initialization for a new interface.
    ///
    /// Runs before the interface is linked into the driver's interface set;
    /// on error nothing becomes externally visible. The returned spec
    /// declares the initial universes, the universe limit, and the
    /// per-interface hooks.
    fn create_interface(&self, properties: &PropertyList) -> Result<InterfaceSpec>;

    /// Called once after the driver has been detached and all of its
    /// interfaces torn down.
    fn released(&self) {}
}

/// Hooks carried by one active interface.
pub trait InterfaceHooks: Send + Sync {
    /// Called exactly once per owned universe during interface teardown,
    /// after the universe has been retired (sessions woken with the Closed
    /// outcome). No default body: every back-end must provide its universe
    /// deletion hook.
    fn universe_released(&self, universe: &Universe);

    /// Called once at the end of interface teardown, after every universe
    /// has been released. May re-enter interface deletion; the registry
    /// treats that as an idempotent no-op.
    fn teardown(&self) {}
}

/// What a driver's initialization hook returns: the shape of the new
/// interface.
pub struct InterfaceSpec {
    /// Direction of each initial universe, in order. Must not exceed
    /// `max_universes`.
    pub universes: Vec<Direction>,
    /// Upper bound on the interface's universe count for its whole life.
    pub max_universes: usize,
    /// Lifecycle hooks for the new interface.
    pub hooks: Arc<dyn InterfaceHooks>,
}
