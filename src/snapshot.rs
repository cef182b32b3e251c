//! Immutable point-in-time views of node/value/reference state.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};

use crate::path::PathBuf;
use crate::properties::Properties;

/// A payload slot that starts out pointing at the tree-internal instance
/// and is lazily, idempotently replaced by an owned deep copy on first
/// external read.
///
/// Two threads racing to read `.value()` both compute a clone of the
/// internal instance; `OnceLock::get_or_init` guarantees exactly one of
/// the clones is kept, so the race is harmless.
#[derive(Clone)]
struct PayloadCell<T> {
    internal: Arc<T>,
    copied: Arc<OnceLock<T>>,
}

impl<T: Clone> PayloadCell<T> {
    fn new(internal: Arc<T>) -> Self {
        Self {
            internal,
            copied: Arc::new(OnceLock::new()),
        }
    }

    fn get(&self) -> &T {
        self.copied.get_or_init(|| (*self.internal).clone())
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for PayloadCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.get(), f)
    }
}

/// An immutable view of a node's name/path/properties at a change moment.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    /// The node's name at the moment of the snapshot.
    pub name: String,
    /// The node's fully-resolved path at the moment of the snapshot.
    pub path: PathBuf,
    /// The node's properties at the moment of the snapshot.
    pub properties: Properties,
}

impl NodeSnapshot {
    /// Returns true iff `Persistent` is set.
    pub fn is_persistent(&self) -> bool {
        self.properties.is_persistent()
    }

    /// Returns true iff `Dummy` is set.
    pub fn is_dummy(&self) -> bool {
        self.properties.is_dummy()
    }
}

/// An immutable view of a value's timestamp/properties/payload at a change
/// moment.
#[derive(Clone, Debug)]
pub struct ValueSnapshot<T> {
    /// Last-write timestamp, UTC.
    pub timestamp: DateTime<Utc>,
    /// Properties at the moment of the snapshot.
    pub properties: Properties,
    payload: PayloadCell<T>,
}

impl<T: Clone> ValueSnapshot<T> {
    pub(crate) fn new(
        timestamp: DateTime<Utc>,
        properties: Properties,
        internal: Arc<T>,
    ) -> Self {
        Self {
            timestamp,
            properties,
            payload: PayloadCell::new(internal),
        }
    }

    /// Returns the payload, deep-copying it out of the tree on first call.
    pub fn value(&self) -> &T {
        self.payload.get()
    }

    /// Returns true iff `Persistent` is set.
    pub fn is_persistent(&self) -> bool {
        self.properties.is_persistent()
    }

    /// Returns true iff `Dummy` is set.
    pub fn is_dummy(&self) -> bool {
        self.properties.is_dummy()
    }

    /// Returns true iff `Detached` is set.
    pub fn is_detached(&self) -> bool {
        self.properties.is_detached()
    }
}

/// An immutable view of a reference's observable state at a change moment.
#[derive(Clone, Debug)]
pub struct ReferenceSnapshot<T> {
    /// The referenced value's name.
    pub name: String,
    /// The reference's fixed path.
    pub path: PathBuf,
    /// The bound value's timestamp, UTC, at the moment of the snapshot.
    pub timestamp: DateTime<Utc>,
    /// Properties at the moment of the snapshot.
    pub properties: Properties,
    /// Whether a live binding existed at the moment of the snapshot.
    pub is_healthy: bool,
    payload: Option<PayloadCell<T>>,
}

impl<T: Clone> ReferenceSnapshot<T> {
    pub(crate) fn healthy(
        name: String,
        path: PathBuf,
        timestamp: DateTime<Utc>,
        properties: Properties,
        internal: Arc<T>,
    ) -> Self {
        Self {
            name,
            path,
            timestamp,
            properties,
            is_healthy: true,
            payload: Some(PayloadCell::new(internal)),
        }
    }

    pub(crate) fn broken(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            timestamp: Utc::now(),
            properties: Properties::NONE,
            is_healthy: false,
            payload: None,
        }
    }

    /// Returns the payload, if the reference was healthy and bound to a
    /// non-dummy value at the moment of the snapshot.
    pub fn value(&self) -> Option<&T> {
        self.payload.as_ref().map(PayloadCell::get)
    }

    /// Returns true iff `Persistent` is set.
    pub fn is_persistent(&self) -> bool {
        self.properties.is_persistent()
    }

    /// Returns true iff `Dummy` is set.
    pub fn is_dummy(&self) -> bool {
        self.properties.is_dummy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_cell_copies_lazily_and_caches() {
        let internal = Arc::new(vec![1, 2, 3]);
        let cell = PayloadCell::new(internal.clone());
        let first = cell.get().clone();
        assert_eq!(first, *internal);
        // mutate the "tree" side out from under the cell; the snapshot's
        // cached copy must not change.
        let second = cell.get();
        assert_eq!(*second, first);
    }

    #[test]
    fn reference_snapshot_broken_has_no_value() {
        let snap: ReferenceSnapshot<u32> = ReferenceSnapshot::broken("x".into(), PathBuf::root());
        assert!(!snap.is_healthy);
        assert!(snap.value().is_none());
    }
}
