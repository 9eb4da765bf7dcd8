//! `dmx-core`
//!
//! Core types and traits for the rust-dmx universe multiplexing framework.
//!
//! This crate provides the leaf building blocks shared by the registry and
//! by back-end driver crates:
//!
//! - [`error::DmxError`]: the framework-wide error taxonomy
//! - [`property::Property`] / [`property::PropertyList`]: typed,
//!   introspectable configuration values
//! - [`universe::Universe`]: one direction-tagged, 512-slot addressable
//!   channel buffer with a single change-notification point
//! - [`session::Session`]: per-open-handle multiplexer turning universe
//!   mutations into targeted wake-ups for overlapping readers
//! - [`hooks`]: the polymorphic hook traits a back-end implements
//!
//! The registry composing Family → Driver → Interface → Universe lives in
//! the `dmx-hardware` crate; mock back-ends for tests live in
//! `dmx-driver-mock`.

pub mod error;
pub mod hooks;
pub mod property;
pub mod session;
pub mod universe;

pub use error::{DmxError, Result};
pub use hooks::{DriverHooks, FamilyHooks, InterfaceHooks, InterfaceSpec};
pub use property::{Property, PropertyKind, PropertyList, PropertySnapshot, PropertyValue};
pub use session::{ReadOutcome, Readiness, Session};
pub use universe::{ChangeEvent, Direction, Universe, UniverseId, Window, UNIVERSE_SLOTS};

/// Maximum length of a family name, in characters.
pub const FAMILY_NAME_MAX: usize = 31;
