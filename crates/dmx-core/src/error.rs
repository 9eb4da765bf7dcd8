//! Error types for the DMX framework.
//!
//! This module defines the primary error type, [`DmxError`], shared by every
//! crate in the workspace. Using the `thiserror` crate, it provides a single
//! consistent taxonomy for registry lifecycle failures, property access
//! failures, and per-call session errors.
//!
//! Two rules shape the taxonomy:
//!
//! - Creation failures are returned to the immediate caller and never leave
//!   partially-linked state reachable from the registry.
//! - Session read/write errors are per-call and never implicitly close the
//!   session. A `Closed` wake on a blocked read is a defined terminal
//!   outcome, represented by [`crate::session::ReadOutcome::Closed`] rather
//!   than an error variant.

use thiserror::Error;

/// Convenience alias for results using the framework error type.
pub type Result<T> = std::result::Result<T, DmxError>;

/// Primary error type for the DMX framework.
#[derive(Error, Debug)]
pub enum DmxError {
    /// A name collided with one already present in its scope (family names
    /// in the registry, driver names within a family, property names within
    /// a list).
    #[error("name '{0}' is already registered")]
    DuplicateName(String),

    /// Lookup failed; the payload names what was looked up.
    #[error("'{0}' not found")]
    NotFound(String),

    /// A name failed validation before registration.
    ///
    /// Family names must be non-empty and at most
    /// [`FAMILY_NAME_MAX`](crate::FAMILY_NAME_MAX) characters.
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A bounded resource pool is exhausted.
    ///
    /// Returned when growing an interface past its `max_universes` limit.
    #[error("resource limit reached: {0}")]
    OutOfMemory(&'static str),

    /// A back-end initialization hook failed; nothing was linked.
    #[error("interface initialization failed: {0}")]
    InitFailed(String),

    /// Non-cascading deletion was refused because children remain.
    ///
    /// The owner is left fully intact; the payload names the owner role.
    #[error("{0} still has active children")]
    HasActiveChildren(&'static str),

    /// A session operation requires a bound target universe.
    #[error("session is not bound to a universe")]
    NotBound,

    /// A window or seek position falls outside the valid slot range.
    #[error("range [{start}, {start}+{size}) exceeds the {max}-slot bounds")]
    InvalidRange {
        /// First slot of the offending range.
        start: usize,
        /// Length of the offending range.
        size: usize,
        /// The bound that was exceeded.
        max: usize,
    },

    /// A buffer access would run past the universe's slot count.
    #[error("access at slot {offset} with length {len} exceeds {max} slots")]
    OutOfRange {
        /// First slot of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// The universe slot count.
        max: usize,
    },

    /// A write was attempted on a target that cannot be written: a property
    /// without a write accessor, or a session bound to a non-output universe.
    #[error("target is read-only")]
    ReadOnly,

    /// The owner is shutting down and accepts no new children or bindings.
    #[error("target is not available")]
    NotAvailable,

    /// A property was written with a value of the wrong kind.
    #[error("property kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        /// Kind fixed at the property's creation.
        expected: &'static str,
        /// Kind of the rejected value.
        actual: &'static str,
    },

    /// A caller-capped enumeration could not report every entry.
    #[error("enumeration capacity {cap} is smaller than the {len} entries present")]
    Truncated {
        /// Capacity supplied by the caller.
        cap: usize,
        /// Entries actually present.
        len: usize,
    },
}
