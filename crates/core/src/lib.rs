//! Corral core types: resource metadata, versions, labels, watch events and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod error;
pub mod fields;

pub use error::{StateError, StateResult};

/// Opaque conflict guard attached to every stored resource.
///
/// `Undefined` means "the caller does not know the current version"; the store
/// only ever hands out concrete values starting at 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Version {
    #[default]
    Undefined,
    Value(u64),
}

impl Version {
    pub const fn initial() -> Self { Version::Value(1) }

    pub fn is_undefined(&self) -> bool { matches!(self, Version::Undefined) }

    /// Next concrete version. An undefined version advances to the initial one.
    pub fn next(&self) -> Self {
        match self {
            Version::Undefined => Self::initial(),
            Version::Value(v) => Version::Value(v.saturating_add(1)),
        }
    }

    pub fn value(&self) -> Option<u64> {
        match self {
            Version::Undefined => None,
            Version::Value(v) => Some(*v),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Undefined => f.write_str("undefined"),
            Version::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Lifecycle phase; `TearingDown` is the pending-deletion marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => f.write_str("running"),
            Phase::TearingDown => f.write_str("tearingDown"),
        }
    }
}

/// Resource identity: `(namespace, type, id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), resource_type: resource_type.into(), id: id.into() }
    }

    pub fn kind(&self) -> Kind { Kind::new(self.namespace.clone(), self.resource_type.clone()) }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.resource_type, self.id)
    }
}

/// A `(namespace, type)` pair addressing a whole collection of resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind {
    pub namespace: String,
    pub resource_type: String,
}

impl Kind {
    pub fn new(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), resource_type: resource_type.into() }
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.namespace == key.namespace && self.resource_type == key.resource_type
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.resource_type)
    }
}

/// Label set kept sorted by key; keys are unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Labels(SmallVec<[(String, String); 8]>);

impl Labels {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool { self.get(key).is_some() }

    /// Insert or replace; returns the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.binary_search_by(|(k, _)| k.as_str().cmp(&key)) {
            Ok(i) => Some(std::mem::replace(&mut self.0[i].1, value)),
            Err(i) => {
                self.0.insert(i, (key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        match self.0.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            Ok(i) => Some(self.0.remove(i).1),
            Err(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut out = Labels::new();
        for (k, v) in iter { out.set(k, v); }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceMetadata {
    pub namespace: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub finalizers: BTreeSet<String>,
    #[serde(default)]
    pub labels: Labels,
    /// Set by the store on create.
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    /// Set by the store on every mutation.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl ResourceMetadata {
    /// Metadata for a resource not yet known to the store.
    pub fn new(namespace: impl Into<String>, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into(),
            id: id.into(),
            version: Version::Undefined,
            phase: Phase::Running,
            finalizers: BTreeSet::new(),
            labels: Labels::new(),
            created: None,
            updated: None,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace.clone(), self.resource_type.clone(), self.id.clone())
    }

    pub fn kind(&self) -> Kind { Kind::new(self.namespace.clone(), self.resource_type.clone()) }

    pub fn is_torn_down(&self) -> bool { self.phase == Phase::TearingDown }
}

/// A versioned, namespaced, typed unit of declarative state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub metadata: ResourceMetadata,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Resource {
    pub fn new(metadata: ResourceMetadata, spec: serde_json::Value) -> Self { Self { metadata, spec } }

    pub fn key(&self) -> ResourceKey { self.metadata.key() }

    pub fn version(&self) -> Version { self.metadata.version }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.set(key, value);
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.metadata.version = version;
        self
    }
}

/// Entry of a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WatchEvent {
    Created(Resource),
    Updated { old: Resource, new: Resource },
    Destroyed(Resource),
    /// Initial contents of a collection watch have all been delivered.
    Bootstrapped,
    /// The watch cannot continue (e.g. the subscriber fell behind); the stream ends after this.
    Errored(String),
}

impl WatchEvent {
    /// The resource the event is about (the new state for updates).
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            WatchEvent::Created(r) | WatchEvent::Destroyed(r) => Some(r),
            WatchEvent::Updated { new, .. } => Some(new),
            WatchEvent::Bootstrapped | WatchEvent::Errored(_) => None,
        }
    }

    pub fn version(&self) -> Option<Version> { self.resource().map(|r| r.metadata.version) }

    pub fn kind_str(&self) -> &'static str {
        match self {
            WatchEvent::Created(_) => "created",
            WatchEvent::Updated { .. } => "updated",
            WatchEvent::Destroyed(_) => "destroyed",
            WatchEvent::Bootstrapped => "bootstrapped",
            WatchEvent::Errored(_) => "errored",
        }
    }
}

pub mod prelude {
    pub use super::{Kind, Labels, Phase, Resource, ResourceKey, ResourceMetadata, Version, WatchEvent};
    pub use super::error::{StateError, StateResult};
    pub use super::fields::{BasicItem, FieldAdapter, FieldRegistry, ListItem};
}
