//! `dmx-hardware`
//!
//! The composition root of the rust-dmx framework: a process-wide registry
//! that assembles back-ends into the Family → Driver → Interface → Universe
//! tree and drives their cascading lifecycle.
//!
//! Back-ends register a [`Family`](registry::Family) and its drivers once at
//! startup; consumers then ask a driver (or the family, via autoprobe) for
//! interfaces, and open `dmx_core::Session`s onto the interfaces' universes.

pub mod registry;

pub use registry::{DmxRegistry, Driver, DriverId, Family, FamilyId, Interface, InterfaceId};
