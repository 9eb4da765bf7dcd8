//! Typed, introspectable configuration properties.
//!
//! Properties carry back-end configuration on drivers and interfaces. Each
//! property has a kind fixed at creation (Long, String, Bool, or Enum) and
//! one of two storage strategies:
//!
//! - **Stored**: a plain lock-guarded value, readable and writable.
//! - **Forwarded**: an accessor pair `{read, optional write}` exposing live
//!   back-end state. A forwarded property without a write accessor rejects
//!   `set` with [`DmxError::ReadOnly`].
//!
//! Properties are reference-shared (`Arc<Property>`). Introspection goes
//! through [`Property::snapshot`], which copies kind and value but never the
//! accessor bindings, so inspecting a snapshot can have no side effects on
//! the live back-end.
//!
//! # Example
//!
//! ```rust
//! use dmx_core::property::{Property, PropertyList, PropertyValue};
//!
//! let props = PropertyList::new();
//! props.add(Property::stored("model", PropertyValue::String("usbdmx".into()))).unwrap();
//! props.add(Property::stored("slots", PropertyValue::Long(512))).unwrap();
//!
//! assert_eq!(props.len(), 2);
//! assert_eq!(props.get("slots").unwrap().get(), PropertyValue::Long(512));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DmxError, Result};

/// The value kind of a property, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// Signed 64-bit integer.
    Long,
    /// UTF-8 string.
    String,
    /// Boolean flag.
    Bool,
    /// Index into a fixed choice list.
    Enum,
}

impl PropertyKind {
    /// Human-readable kind name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Enum => "enum",
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A property value, one variant per [`PropertyKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    /// Signed 64-bit integer.
    Long(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean flag.
    Bool(bool),
    /// Index into the property's choice list.
    Enum(usize),
}

impl PropertyValue {
    /// Kind of this value.
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Long(_) => PropertyKind::Long,
            Self::String(_) => PropertyKind::String,
            Self::Bool(_) => PropertyKind::Bool,
            Self::Enum(_) => PropertyKind::Enum,
        }
    }
}

/// Read accessor forwarding `get` to live back-end state.
pub type ReadAccessor = Arc<dyn Fn() -> PropertyValue + Send + Sync>;

/// Write accessor forwarding `set` to live back-end state.
pub type WriteAccessor = Arc<dyn Fn(PropertyValue) -> Result<()> + Send + Sync>;

enum Storage {
    Stored(RwLock<PropertyValue>),
    Forwarded {
        read: ReadAccessor,
        write: Option<WriteAccessor>,
    },
}

/// A typed configuration value with a fixed kind and optional live accessors.
pub struct Property {
    name: String,
    kind: PropertyKind,
    /// Allowed names for Enum properties; empty for other kinds.
    choices: Vec<String>,
    storage: Storage,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.get())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Property {
    /// Create a stored (non-forwarding) property with an initial value.
    pub fn stored(name: impl Into<String>, initial: PropertyValue) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: initial.kind(),
            choices: Vec::new(),
            storage: Storage::Stored(RwLock::new(initial)),
        })
    }

    /// Create a stored Enum property selecting `index` out of `choices`.
    pub fn enumerated(
        name: impl Into<String>,
        choices: Vec<String>,
        index: usize,
    ) -> Result<Arc<Self>> {
        if index >= choices.len() {
            return Err(DmxError::InvalidRange {
                start: index,
                size: 1,
                max: choices.len(),
            });
        }
        Ok(Arc::new(Self {
            name: name.into(),
            kind: PropertyKind::Enum,
            choices,
            storage: Storage::Stored(RwLock::new(PropertyValue::Enum(index))),
        }))
    }

    /// Create a forwarded property backed by an accessor pair.
    ///
    /// Without a write accessor the property is read-only: `set` fails with
    /// [`DmxError::ReadOnly`].
    pub fn forwarded(
        name: impl Into<String>,
        kind: PropertyKind,
        read: ReadAccessor,
        write: Option<WriteAccessor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            choices: Vec::new(),
            storage: Storage::Forwarded { read, write },
        })
    }

    /// Property name, unique within its owning [`PropertyList`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind fixed at creation.
    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Allowed choice names for Enum properties (empty otherwise).
    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    /// Whether `set` can succeed on this property.
    pub fn is_writable(&self) -> bool {
        match &self.storage {
            Storage::Stored(_) => true,
            Storage::Forwarded { write, .. } => write.is_some(),
        }
    }

    /// Current value: the stored value, or whatever the read accessor
    /// reports for forwarded properties.
    pub fn get(&self) -> PropertyValue {
        match &self.storage {
            Storage::Stored(value) => value.read().clone(),
            Storage::Forwarded { read, .. } => read(),
        }
    }

    /// Update the value.
    ///
    /// The new value must match the kind fixed at creation
    /// ([`DmxError::KindMismatch`]); Enum indices must address a valid
    /// choice ([`DmxError::InvalidRange`]). Forwarded properties without a
    /// write accessor fail with [`DmxError::ReadOnly`].
    pub fn set(&self, value: PropertyValue) -> Result<()> {
        if value.kind() != self.kind {
            return Err(DmxError::KindMismatch {
                expected: self.kind.name(),
                actual: value.kind().name(),
            });
        }
        if let PropertyValue::Enum(index) = value {
            if index >= self.choices.len() {
                return Err(DmxError::InvalidRange {
                    start: index,
                    size: 1,
                    max: self.choices.len(),
                });
            }
        }
        match &self.storage {
            Storage::Stored(stored) => {
                *stored.write() = value;
                Ok(())
            }
            Storage::Forwarded { write: None, .. } => Err(DmxError::ReadOnly),
            Storage::Forwarded {
                write: Some(write), ..
            } => write(value),
        }
    }

    /// Detached copy of kind and current value.
    ///
    /// Accessor bindings are never carried over: mutating or re-reading the
    /// snapshot has no effect on, and sees no further changes from, the live
    /// property.
    pub fn snapshot(&self) -> PropertySnapshot {
        PropertySnapshot {
            name: self.name.clone(),
            kind: self.kind,
            value: self.get(),
            choices: self.choices.clone(),
        }
    }
}

/// A detached, non-live copy of a property for safe introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    /// Property name.
    pub name: String,
    /// Kind fixed at the property's creation.
    pub kind: PropertyKind,
    /// Value at snapshot time.
    pub value: PropertyValue,
    /// Choice names for Enum properties.
    pub choices: Vec<String>,
}

/// A unique-name collection of properties scoped to one owner.
#[derive(Default)]
pub struct PropertyList {
    entries: RwLock<BTreeMap<String, Arc<Property>>>,
}

impl fmt::Debug for PropertyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyList")
            .field("len", &self.len())
            .finish()
    }
}

impl PropertyList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property; fails with [`DmxError::DuplicateName`] if a
    /// property of the same name is already present.
    pub fn add(&self, property: Arc<Property>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(property.name()) {
            return Err(DmxError::DuplicateName(property.name().to_string()));
        }
        entries.insert(property.name().to_string(), property);
        Ok(())
    }

    /// Look up a property by name.
    pub fn get(&self, name: &str) -> Option<Arc<Property>> {
        self.entries.read().get(name).cloned()
    }

    /// Remove and return a property by name.
    pub fn remove(&self, name: &str) -> Result<Arc<Property>> {
        self.entries
            .write()
            .remove(name)
            .ok_or_else(|| DmxError::NotFound(name.to_string()))
    }

    /// Number of properties in the list.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Report all property names, in name order.
    ///
    /// `cap` is the caller's capacity; if more names are present than fit,
    /// the call fails with [`DmxError::Truncated`] and reports nothing.
    pub fn enumerate(&self, cap: usize) -> Result<Vec<String>> {
        let entries = self.entries.read();
        if entries.len() > cap {
            return Err(DmxError::Truncated {
                cap,
                len: entries.len(),
            });
        }
        Ok(entries.keys().cloned().collect())
    }

    /// Detached snapshots of every property, in name order.
    pub fn snapshot(&self) -> Vec<PropertySnapshot> {
        self.entries.read().values().map(|p| p.snapshot()).collect()
    }
}
