//! Ordered child-node and value collections.

pub(crate) mod node_collection;
pub(crate) mod value_collection;
