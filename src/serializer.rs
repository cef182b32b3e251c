//! The persistence boundary: an injected, versioned serializer that owns
//! the concrete on-disk format. The tree manager never encodes bytes
//! itself; it only walks the regular, persistent subtree and hands each
//! node and value to whatever `Serializer` it was built with.
//!
//! No concrete format ships here. The payload of a value is a
//! `TypeId`-tagged `Arc<dyn Any + Send + Sync>`, and only a serializer
//! built for a closed set of payload types can actually encode or decode
//! one; callers that need a real format provide their own implementation
//! (tests use an in-memory one scoped to the test crate).

use std::any::{Any, TypeId};
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::node::Node;
use crate::properties::Properties;

/// One regular, persistent value as seen by a serializer: everything it
/// needs to encode the value without reaching back into the tree.
pub struct ValueRecord<'a> {
    pub name: &'a str,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
    pub type_id: TypeId,
    pub payload: &'a (dyn Any + Send + Sync),
}

/// Injected persistence strategy.
///
/// Only regular, persistent nodes and values are ever passed to
/// `write_tree`; dummy and non-persistent entries are filtered out before
/// this trait is consulted. `read_tree` populates `host` (an existing,
/// typically freshly created, node) by calling back into the same public
/// operations (`get_data_node`, `set_value`, ...) any other caller would
/// use, so every node and value it creates has its `path` computed from
/// the live parent chain rather than trusting anything recorded in the
/// byte stream.
pub trait Serializer: Send + Sync {
    /// The archive version this serializer writes. Only version 1 is
    /// required to round-trip; a serializer may refuse to read an
    /// unrecognized version with `Error::VersionNotSupported`.
    fn archive_version(&self) -> u32;

    /// Writes the regular, persistent subtree rooted at `root` to `sink`.
    fn write_tree(&self, root: &Node, sink: &mut dyn Write) -> Result<()>;

    /// Reads a subtree from `source`, recreating it under `host`.
    fn read_tree(&self, source: &mut dyn Read, host: &Node) -> Result<()>;

    /// Deep-copies a single type-erased payload, for serializer
    /// implementations that need to duplicate a value's payload (e.g.
    /// while buffering a write) without knowing its concrete type.
    fn copy_value(
        &self,
        type_id: TypeId,
        payload: &(dyn Any + Send + Sync),
    ) -> Result<Arc<dyn Any + Send + Sync>>;
}

/// Walks `root`'s regular, persistent subtree, yielding one `ValueRecord`
/// per regular, persistent value, depth-first. A `Serializer::write_tree`
/// implementation uses this instead of re-deriving the traversal.
pub fn for_each_persistent_value(root: &Node, mut visit: impl FnMut(&Node, ValueRecord<'_>)) {
    fn walk(node: &Node, visit: &mut dyn FnMut(&Node, ValueRecord<'_>)) {
        if !node.is_persistent() {
            return;
        }
        for value in node.values_regular() {
            let properties = value.properties();
            if !properties.is_persistent() {
                continue;
            }
            let name = value.name();
            let timestamp = value.timestamp_value();
            let type_id = value.value_type;
            let payload = value.payload_arc();
            visit(
                node,
                ValueRecord {
                    name: &name,
                    properties,
                    timestamp,
                    type_id,
                    payload: payload.as_ref(),
                },
            );
        }
        for child in node.children() {
            walk(&child, visit);
        }
    }
    walk(root, &mut visit);
}

fn unsupported_type(type_id: TypeId) -> Error {
    Error::Serialization(format!("no codec registered for type {type_id:?}"))
}

/// A minimal codec table for primitive payload types, shared by
/// serializer implementations that only need to support the handful of
/// scalar types this store is meant for; an implementation for a richer
/// type set supplies its own `copy_value`.
pub fn copy_primitive(
    type_id: TypeId,
    payload: &(dyn Any + Send + Sync),
) -> Result<Arc<dyn Any + Send + Sync>> {
    macro_rules! try_copy {
        ($t:ty) => {
            if type_id == TypeId::of::<$t>() {
                let v = payload
                    .downcast_ref::<$t>()
                    .expect("type_id matched downcast");
                return Ok(Arc::new(v.clone()) as Arc<dyn Any + Send + Sync>);
            }
        };
    }
    try_copy!(bool);
    try_copy!(i64);
    try_copy!(u64);
    try_copy!(f64);
    try_copy!(String);
    Err(unsupported_type(type_id))
}
