//! An in-process, hierarchical, observable store of typed scalar values.
//!
//! Clients address values by path (`/a/b/value`), observe property and
//! value changes, and hold long-lived [`Reference`]s that automatically
//! rebind to the underlying value even when it is deleted and later
//! recreated. The whole tree is serializable through an injected
//! [`Serializer`].
//!
//! The root of a tree is a [`Node`]; children and values are reached
//! through it by path. A [`DispatcherHost`] owns the maintenance worker
//! used for periodic dummy-path cleanup and for subscriptions that have
//! no caller-affinity context of their own.

mod collections;
mod dispatcher;
mod error;
mod events;
mod listeners;
mod manager;
mod node;
mod path;
mod properties;
mod reference;
mod serializer;
mod snapshot;
mod value;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Arc, OnceLock};

pub use dispatcher::{Dispatch, DispatcherHost, Inline};
pub use error::{Error, Result};
pub use events::{
    ChangeFlags, CollectionAction, DataChangedFlags, NodeChangedFlags, NodeCollectionEvent,
    NodeEvent, ReferenceEvent, ValueCollectionEvent, ValueEvent,
};
pub use listeners::SubscriptionId;
pub use node::Node;
pub use path::{escape, is_valid_name, join, validate, PathBuf};
pub use properties::Properties;
pub use reference::Reference;
pub use serializer::{copy_primitive, for_each_persistent_value, Serializer, ValueRecord};
pub use snapshot::{NodeSnapshot, ReferenceSnapshot, ValueSnapshot};
pub use value::Value;

use manager::ManagerInner;
use node::NodeInner;

const DEFAULT_ROOT_NAME: &str = "Data Manager";

static DEFAULT_INSTANCE: OnceLock<Node> = OnceLock::new();

/// Constructs the process-wide default tree: loads it from `file_path` if
/// that file exists, otherwise creates an empty tree named `"Data
/// Manager"` flagged `Persistent`. `dispatcher` drives the returned
/// tree's periodic dummy cleanup; `serializer` both reads the existing
/// file (if any) and is attached to the tree for later saves.
///
/// Calling this a second time fails with `Error::InvalidOperation`; use
/// [`default_instance`] to fetch the already-initialized tree.
pub fn init_default_instance(
    file_path: Option<&Path>,
    dispatcher: DispatcherHost,
    serializer: Arc<dyn Serializer>,
) -> Result<Node> {
    if DEFAULT_INSTANCE.get().is_some() {
        return Err(Error::InvalidOperation(
            "default instance has already been initialized",
        ));
    }
    let manager = ManagerInner::new(dispatcher, serializer.clone());
    let inner = NodeInner::new_root(
        manager.clone(),
        DEFAULT_ROOT_NAME.to_string(),
        Properties::PERSISTENT,
    );
    let root = Node::from_inner(inner);
    if let Some(existing) = file_path.filter(|p| p.exists()) {
        let file = File::open(existing).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut reader = std::io::BufReader::new(file);
        serializer.read_tree(&mut reader, &root)?;
    }
    manager.dispatcher().register_tree(&manager);
    DEFAULT_INSTANCE.set(root.clone()).map_err(|_| {
        Error::InvalidOperation("default instance has already been initialized")
    })?;
    Ok(root)
}

/// Returns the process-wide default tree if [`init_default_instance`] has
/// already run, `None` otherwise.
pub fn default_instance() -> Option<Node> {
    DEFAULT_INSTANCE.get().cloned()
}

/// Saves `root`'s regular, persistent subtree to `file_path` using
/// `serializer`.
pub fn save_to_file(root: &Node, file_path: &Path, serializer: &dyn Serializer) -> Result<()> {
    let file = File::create(file_path).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut writer = BufWriter::new(file);
    serializer.write_tree(root, &mut writer)
}

/// Constructs a fresh, unrelated tree rooted at `name` with the given
/// root properties. Unlike [`init_default_instance`] this may be called
/// any number of times; it is the entry point tests and embedders use to
/// stand up a tree of their own.
pub fn new_tree(
    name: &str,
    properties: Properties,
    dispatcher: DispatcherHost,
    serializer: Arc<dyn Serializer>,
) -> Result<Node> {
    if !path::is_valid_name(name) {
        return Err(Error::Argument("name", "invalid root name".into()));
    }
    let manager = ManagerInner::new(dispatcher, serializer);
    manager.dispatcher().register_tree(&manager);
    let inner = NodeInner::new_root(manager, name.to_string(), properties);
    Ok(Node::from_inner(inner))
}
