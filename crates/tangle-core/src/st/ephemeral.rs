//! In-memory state tree
//!
//! Reference implementation of [`StateObject`] used by embedding processes
//! and by the entanglement tests. Documents hold attributes and child
//! documents; mutation events bubble synchronously from the changed node up
//! through its ancestors, so a listener on any document observes its whole
//! subtree in mutation order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use super::{
    Listener, ListenerId, NodeKind, StateChange, StateObject, StateParent, StatePath, StateUpdate,
    Value,
};

/// Ordered listener registry shared by documents and attributes
#[derive(Default)]
struct ListenerSet {
    entries: Mutex<Vec<(ListenerId, Listener)>>,
    next: AtomicU64,
}

impl ListenerSet {
    fn add(&self, listener: Listener) -> ListenerId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) {
        self.entries.lock().retain(|(entry, _)| *entry != id);
    }

    fn notify(&self, change: &StateChange) {
        // Snapshot under the lock, invoke outside it
        let listeners: Vec<Listener> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

/// A single in-memory attribute
pub struct EphemeralAttribute {
    path: StatePath,
    parent: Weak<EphemeralDocument>,
    value: Mutex<Option<Value>>,
    listeners: ListenerSet,
}

impl EphemeralAttribute {
    fn new(path: StatePath, parent: Weak<EphemeralDocument>) -> Arc<Self> {
        Arc::new(Self {
            path,
            parent,
            value: Mutex::new(None),
            listeners: ListenerSet::default(),
        })
    }

    /// Current value, if set
    pub fn value(&self) -> Option<Value> {
        self.value.lock().clone()
    }

    /// Replace the value, notifying this node's listeners and every
    /// ancestor document.
    pub fn set_value(&self, new: Option<Value>) {
        let old = {
            let mut guard = self.value.lock();
            std::mem::replace(&mut *guard, new.clone())
        };
        if old == new {
            return;
        }
        let change = StateChange::AttributeChanged {
            path: self.path.clone(),
            old,
            new,
        };
        self.listeners.notify(&change);
        if let Some(parent) = self.parent.upgrade() {
            parent.bubble(&change);
        }
    }
}

impl StateObject for EphemeralAttribute {
    fn kind(&self) -> NodeKind {
        NodeKind::Attribute
    }

    fn path(&self) -> StatePath {
        self.path.clone()
    }

    fn parent(&self) -> Option<Arc<dyn StateParent>> {
        self.parent
            .upgrade()
            .map(|doc| doc as Arc<dyn StateParent>)
    }

    fn get(&self, path: &StatePath) -> Option<Value> {
        if *path == self.path {
            self.value()
        } else {
            None
        }
    }

    fn set(&self, path: &StatePath, value: Value) {
        if *path == self.path {
            self.set_value(Some(value));
        } else {
            warn!(%path, own = %self.path, "Ignoring set outside attribute");
        }
    }

    fn merge(&self, update: &StateUpdate) {
        for (path, value) in &update.changed {
            if *path == self.path {
                self.set_value(Some(value.clone()));
            }
        }
        for path in &update.removed {
            if *path == self.path {
                self.set_value(None);
            }
        }
    }

    fn snapshot(&self, whitelist: &[StatePath]) -> StateUpdate {
        if !included(&self.path, whitelist) {
            return StateUpdate::default();
        }
        match self.value() {
            Some(value) => StateUpdate::change(self.path.clone(), value),
            None => StateUpdate::default(),
        }
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

struct DocInner {
    attributes: HashMap<String, Arc<EphemeralAttribute>>,
    documents: HashMap<String, Arc<dyn StateObject>>,
}

/// An in-memory document node holding attributes and child documents
pub struct EphemeralDocument {
    path: StatePath,
    parent: Weak<EphemeralDocument>,
    me: Weak<EphemeralDocument>,
    inner: Mutex<DocInner>,
    listeners: ListenerSet,
}

impl EphemeralDocument {
    /// Create a root document
    pub fn root() -> Arc<Self> {
        Self::build(StatePath::root(), Weak::new())
    }

    fn build(path: StatePath, parent: Weak<EphemeralDocument>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            path,
            parent,
            me: me.clone(),
            inner: Mutex::new(DocInner {
                attributes: HashMap::new(),
                documents: HashMap::new(),
            }),
            listeners: ListenerSet::default(),
        })
    }

    fn me(&self) -> Arc<EphemeralDocument> {
        // The self-reference is set in build(); a document is never reachable
        // after its strong count hits zero.
        self.me.upgrade().expect("self reference alive")
    }

    /// Get or create the attribute with the given id
    pub fn attribute(&self, id: &str) -> Arc<EphemeralAttribute> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.attributes.get(id) {
            return existing.clone();
        }
        let attribute = EphemeralAttribute::new(self.path.child(id), self.me.clone());
        inner.attributes.insert(id.to_owned(), attribute.clone());
        attribute
    }

    /// Get or create the child document with the given id
    pub fn document(&self, id: &str) -> Arc<dyn StateObject> {
        let (node, created) = {
            let mut inner = self.inner.lock();
            match inner.documents.get(id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let doc = Self::build(self.path.child(id), self.me.clone());
                    let node: Arc<dyn StateObject> = doc;
                    inner.documents.insert(id.to_owned(), node.clone());
                    (node, true)
                }
            }
        };
        if created {
            self.bubble(&StateChange::DocumentAdded {
                path: self.path.child(id),
            });
        }
        node
    }

    /// Set the attribute `id` directly on this document
    pub fn set_attribute(&self, id: &str, value: Value) {
        self.attribute(id).set_value(Some(value));
    }

    /// Remove the child (attribute or document) with the given id
    pub fn remove(&self, id: &str) {
        let change = {
            let mut inner = self.inner.lock();
            if inner.documents.remove(id).is_some() {
                Some(StateChange::DocumentRemoved {
                    path: self.path.child(id),
                })
            } else if let Some(attribute) = inner.attributes.remove(id) {
                attribute.value().map(|old| StateChange::AttributeChanged {
                    path: self.path.child(id),
                    old: Some(old),
                    new: None,
                })
            } else {
                None
            }
        };
        if let Some(change) = change {
            self.bubble(&change);
        }
    }

    /// Resolve a node anywhere beneath this document (or this document
    /// itself) by absolute path.
    pub fn node_at(&self, path: &StatePath) -> Option<Arc<dyn StateObject>> {
        if !self.path.is_ancestor_of(path) {
            return None;
        }
        let remainder = &path.segments()[self.path.segments().len()..];
        let mut current: Arc<dyn StateObject> = self.me();
        for segment in remainder {
            current = current.node(segment)?;
        }
        Some(current)
    }

    /// Deliver a change to this document's listeners and bubble it upward
    pub(crate) fn bubble(&self, change: &StateChange) {
        self.listeners.notify(change);
        if let Some(parent) = self.parent.upgrade() {
            parent.bubble(change);
        }
    }

    fn remove_path(&self, path: &StatePath) {
        if !self.path.is_ancestor_of(path) || *path == self.path {
            warn!(%path, own = %self.path, "Ignoring removal outside document");
            return;
        }
        let remainder = &path.segments()[self.path.segments().len()..];
        if remainder.len() == 1 {
            self.remove(&remainder[0]);
        } else if let Some(child) = self.node(&remainder[0]) {
            child.merge(&StateUpdate::removal(path.clone()));
        } else {
            warn!(%path, "Removal for unknown path ignored");
        }
    }
}

impl StateParent for EphemeralDocument {
    fn set_node(&self, id: &str, node: Arc<dyn StateObject>) {
        if node.kind() != NodeKind::Document {
            warn!(id, "Representation swap only applies to documents");
            return;
        }
        // Representation swap, not a tree mutation: no event is fired.
        self.inner.lock().documents.insert(id.to_owned(), node);
    }
}

impl StateObject for EphemeralDocument {
    fn kind(&self) -> NodeKind {
        NodeKind::Document
    }

    fn path(&self) -> StatePath {
        self.path.clone()
    }

    fn parent(&self) -> Option<Arc<dyn StateParent>> {
        self.parent
            .upgrade()
            .map(|doc| doc as Arc<dyn StateParent>)
    }

    fn node(&self, id: &str) -> Option<Arc<dyn StateObject>> {
        let inner = self.inner.lock();
        inner.documents.get(id).cloned().or_else(|| {
            inner
                .attributes
                .get(id)
                .map(|attr| attr.clone() as Arc<dyn StateObject>)
        })
    }

    fn get(&self, path: &StatePath) -> Option<Value> {
        self.node_at(path)?.get(path)
    }

    fn set(&self, path: &StatePath, value: Value) {
        if !self.path.is_ancestor_of(path) || *path == self.path {
            warn!(%path, own = %self.path, "Ignoring set outside document");
            return;
        }
        let remainder = &path.segments()[self.path.segments().len()..];
        if remainder.len() == 1 {
            self.attribute(&remainder[0]).set_value(Some(value));
        } else {
            // Recurse through the trait so entangled children can delegate
            self.document(&remainder[0]).set(path, value);
        }
    }

    fn merge(&self, update: &StateUpdate) {
        for (path, value) in &update.changed {
            self.set(path, value.clone());
        }
        for path in &update.removed {
            self.remove_path(path);
        }
    }

    fn snapshot(&self, whitelist: &[StatePath]) -> StateUpdate {
        let (attributes, documents) = {
            let inner = self.inner.lock();
            (
                inner.attributes.values().cloned().collect::<Vec<_>>(),
                inner.documents.values().cloned().collect::<Vec<_>>(),
            )
        };
        let mut update = StateUpdate::default();
        for attribute in attributes {
            let part = attribute.snapshot(whitelist);
            update.changed.extend(part.changed);
        }
        for document in documents {
            let part = document.snapshot(whitelist);
            update.changed.extend(part.changed);
            update.removed.extend(part.removed);
        }
        update
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

fn included(path: &StatePath, whitelist: &[StatePath]) -> bool {
    whitelist.is_empty() || whitelist.iter().any(|entry| entry.is_ancestor_of(path))
}
