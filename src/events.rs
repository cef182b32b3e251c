//! Change-flag bitsets and event payloads shared by nodes, values, and
//! references.

use crate::snapshot::{NodeSnapshot, ReferenceSnapshot, ValueSnapshot};

/// Bits describing what changed between an entity's old and new state.
/// Node events use the `NAME`/`PATH`/`PROPERTIES`/`IS_PERSISTENT` bits;
/// value and reference events additionally use
/// `VALUE`/`TIMESTAMP`/`IS_HEALTHY`. `INITIAL_UPDATE` is set on every
/// subscription's first delivered event, which is always delivered
/// before any subsequent change notification. `IS_DUMMY` is reserved for
/// entity-level dummy-transition reporting; collection-level `Added`/
/// `Removed` events (`NodeCollectionEvent`/`ValueCollectionEvent`) fire
/// for dummy entries unconditionally instead, distinguishable via the
/// snapshot's own `is_dummy()`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChangeFlags(u16);

macro_rules! flag {
    ($name:ident, $getter:ident, $bit:expr) => {
        #[allow(missing_docs)]
        pub const $name: ChangeFlags = ChangeFlags($bit);

        #[allow(missing_docs)]
        pub fn $getter(self) -> bool {
            self.0 & $bit != 0
        }
    };
}

impl ChangeFlags {
    /// The empty flag set.
    pub const NONE: ChangeFlags = ChangeFlags(0);

    flag!(NAME, name, 1 << 0);
    flag!(PATH, path, 1 << 1);
    flag!(PROPERTIES, properties, 1 << 2);
    flag!(IS_PERSISTENT, is_persistent, 1 << 3);
    flag!(IS_DUMMY, is_dummy, 1 << 4);
    flag!(VALUE, value, 1 << 5);
    flag!(TIMESTAMP, timestamp, 1 << 6);
    flag!(IS_HEALTHY, is_healthy, 1 << 7);
    flag!(INITIAL_UPDATE, initial_update, 1 << 8);

    /// Returns true if no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ChangeFlags {
    type Output = ChangeFlags;
    fn bitor(self, rhs: ChangeFlags) -> ChangeFlags {
        ChangeFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ChangeFlags {
    fn bitor_assign(&mut self, rhs: ChangeFlags) {
        self.0 |= rhs.0;
    }
}

/// Alias used on node subscriptions.
pub type NodeChangedFlags = ChangeFlags;
/// Alias used on value and reference subscriptions.
pub type DataChangedFlags = ChangeFlags;

/// The payload delivered to a node change subscriber.
#[derive(Clone, Debug)]
pub struct NodeEvent {
    /// What changed.
    pub flags: NodeChangedFlags,
    /// The node's state at the moment of the change.
    pub snapshot: NodeSnapshot,
}

/// The action that produced a child/value collection event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollectionAction {
    /// Delivered once, synchronously with subscription, for every entry
    /// already present.
    InitialUpdate,
    /// An entry was added.
    Added,
    /// An entry was removed.
    Removed,
}

/// The payload delivered to a child-node collection subscriber.
#[derive(Clone, Debug)]
pub struct NodeCollectionEvent {
    /// Which action produced this event.
    pub action: CollectionAction,
    /// The affected child's snapshot.
    pub node: NodeSnapshot,
}

/// The payload delivered to a value collection subscriber.
#[derive(Clone, Debug)]
pub struct ValueCollectionEvent<T> {
    /// Which action produced this event.
    pub action: CollectionAction,
    /// The affected value's snapshot.
    pub value: ValueSnapshot<T>,
}

/// The payload delivered to a value change subscriber.
#[derive(Clone, Debug)]
pub struct ValueEvent<T> {
    /// What changed.
    pub flags: DataChangedFlags,
    /// The value's state at the moment of the change.
    pub snapshot: ValueSnapshot<T>,
}

/// The payload delivered to a reference change subscriber.
#[derive(Clone, Debug)]
pub struct ReferenceEvent<T> {
    /// What changed.
    pub flags: DataChangedFlags,
    /// The reference's state at the moment of the change.
    pub snapshot: ReferenceSnapshot<T>,
}
