//! State-tree interface consumed by the entanglement engine
//!
//! The full state-tree storage engine lives outside this crate; replication
//! only needs the small capability surface defined here: path addressing,
//! get/set, merge, snapshot, and ordered listener callbacks. The
//! [`ephemeral`] module provides an in-memory implementation of that surface
//! for embedding processes and tests.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  StateObject: capability trait over one tree node               │
//! │  ├── get/set by absolute path                                   │
//! │  ├── snapshot(whitelist) -> StateUpdate                         │
//! │  ├── merge(&StateUpdate)                                        │
//! │  └── add_listener/remove_listener (synchronous, in order)       │
//! │                                                                 │
//! │  StateUpdate: wire shape for snapshots, deltas, removals        │
//! │  StateChange: local mutation event delivered to listeners       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod ephemeral;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use ephemeral::{EphemeralAttribute, EphemeralDocument};

/// Attribute values are arbitrary JSON
pub type Value = serde_json::Value;

/// Handle for a registered listener callback
pub type ListenerId = u64;

/// Listener callback invoked synchronously for every mutation, in order
pub type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Absolute path of a node in the state tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatePath(Vec<String>);

impl StatePath {
    /// The root path (empty)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a `/a/b/c` path string; empty segments are discarded
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    /// Append a segment, producing the child path
    pub fn child(&self, id: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(id.to_owned());
        Self(segments)
    }

    /// Path of this node's parent; root's parent is root
    pub fn parent(&self) -> Self {
        let mut segments = self.0.clone();
        segments.pop();
        Self(segments)
    }

    /// The final segment, if any
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// The path segments in order
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `other` is this path or lies beneath it
    pub fn is_ancestor_of(&self, other: &StatePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

/// A batch of state mutations as carried on the wire
///
/// A full snapshot is an update whose `changed` list covers every attribute
/// of a subtree; an incremental delta carries a single entry; a removal
/// marker carries only `removed` paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Attribute paths with their new values
    #[serde(with = "value_codec")]
    pub changed: Vec<(StatePath, Value)>,
    /// Paths whose nodes were removed
    pub removed: Vec<StatePath>,
}

/// JSON values travel as strings because the wire format is not
/// self-describing.
mod value_codec {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{StatePath, Value};

    pub fn serialize<S: Serializer>(
        entries: &[(StatePath, Value)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: Vec<(&StatePath, String)> = entries
            .iter()
            .map(|(path, value)| (path, value.to_string()))
            .collect();
        serde::Serialize::serialize(&encoded, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(StatePath, Value)>, D::Error> {
        let encoded: Vec<(StatePath, String)> = Deserialize::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(path, raw)| {
                serde_json::from_str(&raw)
                    .map(|value| (path, value))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

impl StateUpdate {
    /// Delta carrying a single attribute change
    pub fn change(path: StatePath, value: Value) -> Self {
        Self {
            changed: vec![(path, value)],
            removed: Vec::new(),
        }
    }

    /// Removal marker for a single path
    pub fn removal(path: StatePath) -> Self {
        Self {
            changed: Vec::new(),
            removed: vec![path],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Mutation event delivered to listeners
#[derive(Debug, Clone)]
pub enum StateChange {
    /// An attribute's value changed (new = None means it was cleared)
    AttributeChanged {
        path: StatePath,
        old: Option<Value>,
        new: Option<Value>,
    },
    /// A child document appeared
    DocumentAdded { path: StatePath },
    /// A child document was removed
    DocumentRemoved { path: StatePath },
}

impl StateChange {
    /// The path the event refers to
    pub fn path(&self) -> &StatePath {
        match self {
            StateChange::AttributeChanged { path, .. } => path,
            StateChange::DocumentAdded { path } => path,
            StateChange::DocumentRemoved { path } => path,
        }
    }
}

/// Which kind of node a [`StateObject`] wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Attribute,
    Document,
}

/// Capability to swap a child node's representation in place
///
/// Used by the entanglement engine to take over (and later hand back)
/// representation of a live document without a tree mutation.
pub trait StateParent: Send + Sync {
    fn set_node(&self, id: &str, node: Arc<dyn StateObject>);
}

/// Capability surface of one state-tree node
///
/// All paths passed in and out are absolute (rooted at the tree root).
pub trait StateObject: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// This node's absolute path
    fn path(&self) -> StatePath;

    /// The parent document, when the node is attached to one
    fn parent(&self) -> Option<Arc<dyn StateParent>> {
        None
    }

    /// Resolve a direct child by id (documents only)
    fn node(&self, _id: &str) -> Option<Arc<dyn StateObject>> {
        None
    }

    /// Read the attribute value at `path`
    fn get(&self, path: &StatePath) -> Option<Value>;

    /// Write the attribute value at `path`, creating intermediate documents
    fn set(&self, path: &StatePath, value: Value);

    /// Apply a remote update to this subtree
    fn merge(&self, update: &StateUpdate);

    /// Capture current state. An empty whitelist captures the whole subtree;
    /// otherwise only paths at or beneath a whitelist entry are included.
    fn snapshot(&self, whitelist: &[StatePath]) -> StateUpdate;

    /// Register a mutation listener; events arrive synchronously, in
    /// mutation order, until [`remove_listener`](Self::remove_listener).
    fn add_listener(&self, listener: Listener) -> ListenerId;

    /// Deregister a listener. Synchronous: no events are delivered to it
    /// after this returns.
    fn remove_listener(&self, id: ListenerId);

    /// Whether this node is itself an entanglement proxy
    fn entangled(&self) -> bool {
        false
    }
}
