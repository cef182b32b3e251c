//! The node entity: a named container holding child nodes and values.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::collections::node_collection::NodeCollection;
use crate::collections::value_collection::{AddSlot, RawValueCollectionEvent, ValueCollection};
use crate::dispatcher::Dispatch;
use crate::error::{Error, Result};
use crate::events::{ChangeFlags, CollectionAction, NodeCollectionEvent, NodeEvent};
use crate::listeners::{resolve_caller_dispatch, Listeners, SubscriptionId};
use crate::manager::ManagerInner;
use crate::path::{self, PathBuf};
use crate::properties::Properties;
use crate::reference::Reference;
use crate::snapshot::NodeSnapshot;
use crate::value::{Value, ValueInner};

/// The tree-internal node state. Owned strongly by its parent's child
/// collection (or, for a root, by the public [`Node`] handle that created
/// it); referenced weakly by its own children and values as a parent
/// back-link.
pub(crate) struct NodeInner {
    pub(crate) manager: Mutex<Arc<ManagerInner>>,
    pub(crate) parent: Mutex<Weak<NodeInner>>,
    name: Mutex<String>,
    path: Mutex<PathBuf>,
    properties: Mutex<Properties>,
    pub(crate) children: Mutex<NodeCollection>,
    pub(crate) values: Mutex<ValueCollection>,
    listeners: Mutex<Listeners<NodeEvent>>,
}

impl NodeInner {
    fn new(
        manager: Arc<ManagerInner>,
        parent: Weak<NodeInner>,
        name: String,
        path: PathBuf,
        properties: Properties,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager: Mutex::new(manager),
            parent: Mutex::new(parent),
            name: Mutex::new(name),
            path: Mutex::new(path),
            properties: Mutex::new(properties),
            children: Mutex::new(NodeCollection::new()),
            values: Mutex::new(ValueCollection::new()),
            listeners: Mutex::new(Listeners::new()),
        })
    }

    /// Builds a fresh root node with its own manager, wiring the manager's
    /// weak root pointer back to it.
    pub(crate) fn new_root(
        manager: Arc<ManagerInner>,
        name: String,
        properties: Properties,
    ) -> Arc<Self> {
        let root = Self::new(manager.clone(), Weak::new(), name, PathBuf::root(), properties);
        manager.set_root(&root);
        root
    }

    pub(crate) fn manager(&self) -> Arc<ManagerInner> {
        self.manager.lock().clone()
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.path.lock().clone()
    }

    pub(crate) fn properties(&self) -> Properties {
        *self.properties.lock()
    }

    pub(crate) fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            name: self.name(),
            path: self.path(),
            properties: self.properties(),
        }
    }

    fn notify(&self, flags: ChangeFlags) {
        if flags.is_empty() {
            return;
        }
        let event = NodeEvent {
            flags,
            snapshot: self.snapshot(),
        };
        self.listeners.lock().notify(Arc::new(event));
    }

    /// Applies a property transform ("set" wins over "clear"), computing
    /// the Properties/IsPersistent diff. Unsynced.
    pub(crate) fn apply_properties_unsynced(&self, set: Properties, clear: Properties) {
        let old = self.properties();
        let new = old.apply(set, clear);
        if old == new {
            return;
        }
        *self.properties.lock() = new;
        let diff = old.diff(new);
        let mut flags = ChangeFlags::NONE;
        if diff.user_bits().any() {
            flags |= ChangeFlags::PROPERTIES;
        }
        if old.is_persistent() != new.is_persistent() {
            flags |= ChangeFlags::IS_PERSISTENT;
        }
        self.notify(flags);
    }

    fn set_persistent_unsynced(&self, on: bool) {
        if on {
            self.apply_properties_unsynced(Properties::PERSISTENT, Properties::NONE);
        } else {
            self.apply_properties_unsynced(Properties::NONE, Properties::PERSISTENT);
        }
    }

    fn clear_dummy_unsynced(&self) {
        self.apply_properties_unsynced(Properties::NONE, Properties::DUMMY);
    }

    /// Recursively recomputes name/path for this node and everything
    /// beneath it after an ancestor rename, emitting Name/Path events
    /// along the way.
    fn set_name_path_unsynced(&self, name: String, path: PathBuf) {
        let old_name = self.name();
        let old_path = self.path();
        *self.name.lock() = name;
        *self.path.lock() = path.clone();
        let mut flags = ChangeFlags::NONE;
        if self.name() != old_name {
            flags |= ChangeFlags::NAME;
        }
        if self.path() != old_path {
            flags |= ChangeFlags::PATH;
        }
        self.notify(flags);
        for child in self.children.lock().all() {
            let child_path = path.child(&child.name());
            child.set_name_path_unsynced(child.name(), child_path);
        }
        for value in self.values.lock().all() {
            let value_path = path.child(&value.name());
            value.set_name_path_unsynced(value.name(), value_path);
        }
    }

    /// Moves this node's manager (and every descendant's) to a new
    /// manager, used when a subtree is detached and becomes a new root.
    fn reassign_manager_recursive(&self, manager: &Arc<ManagerInner>) {
        *self.manager.lock() = manager.clone();
        for child in self.children.lock().all() {
            child.reassign_manager_recursive(manager);
        }
        for value in self.values.lock().all() {
            *value.manager.lock() = manager.clone();
        }
    }
}

/// A named container holding child nodes and values, addressed by path
/// from a tree root.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    /// The node's name.
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// The node's fully-resolved path.
    pub fn path(&self) -> PathBuf {
        self.inner.path()
    }

    /// The node's current properties.
    pub fn properties(&self) -> Properties {
        self.inner.properties()
    }

    /// Returns true iff `Persistent` is set.
    pub fn is_persistent(&self) -> bool {
        self.properties().is_persistent()
    }

    fn manager(&self) -> Arc<ManagerInner> {
        self.inner.manager()
    }

    fn resolve_root(&self, is_absolute: bool) -> Result<Arc<NodeInner>> {
        if is_absolute {
            self.manager().root().ok_or(Error::ObjectDisposed)
        } else {
            Ok(self.inner.clone())
        }
    }

    /// Resolves `path`, regularizing (creating as needed) every node along
    /// the way with `props`. Unsynced: caller must hold `Sync`.
    fn resolve_node_chain_unsynced(
        start: &Arc<NodeInner>,
        tokens: &[Cow<'_, str>],
        props: Properties,
    ) -> Arc<NodeInner> {
        let mut current = start.clone();
        for name in tokens {
            current = Self::child_regular_unsynced(&current, name, props);
        }
        current
    }

    fn child_regular_unsynced(parent: &Arc<NodeInner>, name: &str, props: Properties) -> Arc<NodeInner> {
        let existing = parent.children.lock().find(name);
        match existing {
            Some(node) if !node.properties().is_dummy() => node,
            Some(node) => {
                node.apply_properties_unsynced(props.user_bits(), Properties::DUMMY);
                parent.children.lock().notify(CollectionAction::Added, &node);
                node
            }
            None => {
                let path = parent.path().child(name);
                let node = NodeInner::new(
                    parent.manager(),
                    Arc::downgrade(parent),
                    name.to_string(),
                    path,
                    props.user_bits(),
                );
                parent.children.lock().insert(node.clone());
                parent.children.lock().notify(CollectionAction::Added, &node);
                node
            }
        }
    }

    /// Resolves `path`, creating missing intermediate nodes as dummies.
    /// Unsynced. Returns the parent chain's final node.
    pub(crate) fn resolve_dummy_chain_unsynced(start: &Arc<NodeInner>, tokens: &[Cow<'_, str>]) -> Arc<NodeInner> {
        let mut current = start.clone();
        for name in tokens {
            current = Self::child_dummy_unsynced(&current, name);
        }
        current
    }

    pub(crate) fn child_dummy_unsynced(parent: &Arc<NodeInner>, name: &str) -> Arc<NodeInner> {
        if let Some(existing) = parent.children.lock().find(name) {
            return existing;
        }
        let path = parent.path().child(name);
        let node = NodeInner::new(
            parent.manager(),
            Arc::downgrade(parent),
            name.to_string(),
            path,
            Properties::DUMMY,
        );
        parent.children.lock().insert(node.clone());
        parent.children.lock().notify(CollectionAction::Added, &node);
        node
    }

    /// Resolves (or creates, as regular, with `props`) the node at `path`.
    pub fn get_data_node(&self, path: &str, props: Properties) -> Result<Node> {
        if !props.is_user_only() {
            return Err(Error::Argument(
                "props",
                "administrative flags may not be set directly".into(),
            ));
        }
        let (is_absolute, tokens) = path::iter(path)?;
        let manager = self.manager();
        let _guard = manager.sync();
        let start = self.resolve_root(is_absolute)?;
        let node = Self::resolve_node_chain_unsynced(&start, &tokens, props);
        Ok(Node::from_inner(node))
    }

    /// Resolves the node at `path` if, and only if, it (and every
    /// ancestor along the way) already exists; creates nothing.
    pub fn get_existing_node(&self, path: &str) -> Result<Node> {
        let (is_absolute, tokens) = path::iter(path)?;
        let manager = self.manager();
        let _guard = manager.sync();
        let mut current = self.resolve_root(is_absolute)?;
        for name in &tokens {
            let next = current
                .children
                .lock()
                .find(name)
                .ok_or_else(|| Error::Argument("path", format!("no node at `{path}`")))?;
            current = next;
        }
        Ok(Node::from_inner(current))
    }

    /// Resolves or creates (as a dummy if missing) the value at `path`,
    /// using `T::default()` as the placeholder payload on creation.
    pub fn get_data_value<T>(&self, path: &str) -> Result<Value<T>>
    where
        T: Clone + Send + Sync + PartialEq + std::fmt::Debug + Default + 'static,
    {
        let (is_absolute, tokens) = path::iter(path)?;
        let (init_tokens, leaf) = split_leaf(&tokens)?;
        let manager = self.manager();
        let _guard = manager.sync();
        let start = self.resolve_root(is_absolute)?;
        let parent = Self::resolve_dummy_chain_unsynced(&start, init_tokens);
        let inner = Self::value_or_create_unsynced(&parent, leaf, Properties::DUMMY, || T::default());
        Value::from_inner(inner)
    }

    /// Resolves or creates the value at `path`. `props` without `Dummy`
    /// creates a regular value seeded with `init`; `props` carrying
    /// `Dummy` creates a dummy value seeded with `init` as its
    /// placeholder payload.
    pub fn get_data_value_with<T>(&self, path: &str, props: Properties, init: T) -> Result<Value<T>>
    where
        T: Clone + Send + Sync + PartialEq + std::fmt::Debug + 'static,
    {
        let allowed = crate::properties::USER_MASK | Properties::DUMMY;
        if (props & !allowed).any() {
            return Err(Error::Argument(
                "props",
                "only Persistent and Dummy may be requested".into(),
            ));
        }
        let (is_absolute, tokens) = path::iter(path)?;
        let (init_tokens, leaf) = split_leaf(&tokens)?;
        let manager = self.manager();
        let _guard = manager.sync();
        let start = self.resolve_root(is_absolute)?;
        let parent = Self::resolve_dummy_chain_unsynced(&start, init_tokens);
        let inner = Self::value_or_create_unsynced(&parent, leaf, props, move || init.clone());
        if !props.is_dummy() {
            regularize_chain_unsynced(&Arc::downgrade(&parent));
            if props.is_persistent() {
                propagate_persistent_unsynced(&Arc::downgrade(&parent));
            }
        }
        Value::from_inner(inner)
    }

    pub(crate) fn value_or_create_unsynced<T, F>(
        parent: &Arc<NodeInner>,
        name: &str,
        props: Properties,
        init: F,
    ) -> Arc<ValueInner>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(existing) = parent.values.lock().find(name) {
            return existing;
        }
        let path = parent.path().child(name);
        let properties = props.user_bits() | (props & Properties::DUMMY);
        let value = ValueInner::new(
            parent.manager(),
            Arc::downgrade(parent),
            name.to_string(),
            path,
            properties,
            init(),
        );
        parent.values.lock().insert(value.clone());
        parent.values.lock().notify(CollectionAction::Added, &value);
        value
    }

    /// Resolves or creates a regular value at `path` with the supplied
    /// payload. On an existing regular value of a different type, fails
    /// with `DataTypeMismatch`. On an existing dummy of a different type,
    /// replaces it (destroy + recreate; old references see the destroy).
    pub fn set_value<T>(&self, path: &str, v: T, props: Properties) -> Result<Value<T>>
    where
        T: Clone + Send + Sync + PartialEq + std::fmt::Debug + 'static,
    {
        if !props.is_user_only() {
            return Err(Error::Argument(
                "props",
                "administrative flags may not be set directly".into(),
            ));
        }
        let (is_absolute, tokens) = path::iter(path)?;
        let (init_tokens, leaf) = split_leaf(&tokens)?;
        let manager = self.manager();
        let _guard = manager.sync();
        let start = self.resolve_root(is_absolute)?;
        let parent = Self::resolve_dummy_chain_unsynced(&start, init_tokens);
        let existing = parent.values.lock().find(leaf);
        let target_type = std::any::TypeId::of::<T>();
        let value_inner = match existing {
            Some(existing) if existing.value_type == target_type => {
                existing.apply_write_unsynced(
                    Some(Arc::new(v.clone())),
                    true,
                    props,
                    Properties::DUMMY,
                );
                existing
            }
            Some(existing) if !existing.properties().is_dummy() => {
                return Err(Error::DataTypeMismatch {
                    path: existing.path(),
                    actual: existing.value_type,
                    requested: target_type,
                });
            }
            Some(existing) => {
                // A dummy of a different T is destroyed and recreated.
                // References of the old type are invalidated but stay
                // registered, so they can still rebind if their own type
                // reappears here later; `retry_bucket_unsynced` gives the
                // newly-created value's matching references a chance to
                // bind right away.
                let existing_path = existing.path();
                manager.invalidate_references_at_unsynced(&existing_path);
                parent.values.lock().remove_by_ptr(&existing);
                let created = Self::value_or_create_unsynced(&parent, leaf, props, move || v.clone());
                manager.retry_bucket_unsynced(&existing_path);
                created
            }
            None => Self::value_or_create_unsynced(&parent, leaf, props, move || v.clone()),
        };
        regularize_chain_unsynced(&Arc::downgrade(&parent));
        if props.is_persistent() {
            propagate_persistent_unsynced(&Arc::downgrade(&parent));
        }
        Value::from_inner(value_inner)
    }

    /// Creates a regular value at `path` seeded with `v`, failing with
    /// `DataValueExistsAlready` if a regular value already occupies the
    /// path. A dummy of the same type occupying the path is promoted in
    /// place; a dummy of a different type is destroyed and recreated
    /// (old references see the destroy, same as `set_value`).
    pub fn add_value<T>(&self, path: &str, v: T, props: Properties) -> Result<Value<T>>
    where
        T: Clone + Send + Sync + PartialEq + std::fmt::Debug + 'static,
    {
        if !props.is_user_only() {
            return Err(Error::Argument(
                "props",
                "administrative flags may not be set directly".into(),
            ));
        }
        let (is_absolute, tokens) = path::iter(path)?;
        let (init_tokens, leaf) = split_leaf(&tokens)?;
        let manager = self.manager();
        let _guard = manager.sync();
        let start = self.resolve_root(is_absolute)?;
        let parent = Self::resolve_dummy_chain_unsynced(&start, init_tokens);
        let target_type = std::any::TypeId::of::<T>();
        let slot = parent
            .values
            .lock()
            .add_dynamically(leaf, target_type, props, Arc::new(v.clone()));
        let value_inner = match slot {
            AddSlot::Promoted(value) => value,
            AddSlot::Collision => {
                return Err(Error::DataValueExistsAlready(parent.path().child(leaf)));
            }
            AddSlot::ReplacedDummy => {
                let existing_path = parent.path().child(leaf);
                manager.invalidate_references_at_unsynced(&existing_path);
                let created = Self::value_or_create_unsynced(&parent, leaf, props, move || v.clone());
                manager.retry_bucket_unsynced(&existing_path);
                created
            }
            AddSlot::Empty => Self::value_or_create_unsynced(&parent, leaf, props, move || v.clone()),
        };
        regularize_chain_unsynced(&Arc::downgrade(&parent));
        if props.is_persistent() {
            propagate_persistent_unsynced(&Arc::downgrade(&parent));
        }
        Value::from_inner(value_inner)
    }

    fn child_add_unsynced(parent: &Arc<NodeInner>, name: &str, props: Properties) -> Result<Arc<NodeInner>> {
        let existing = parent.children.lock().find(name);
        let node = match existing {
            Some(node) if !node.properties().is_dummy() => {
                return Err(Error::DataNodeExistsAlready(parent.path().child(name)));
            }
            Some(node) => {
                node.apply_properties_unsynced(props.user_bits(), Properties::DUMMY);
                parent.children.lock().notify(CollectionAction::Added, &node);
                node
            }
            None => {
                let path = parent.path().child(name);
                let node = NodeInner::new(
                    parent.manager(),
                    Arc::downgrade(parent),
                    name.to_string(),
                    path,
                    props.user_bits(),
                );
                parent.children.lock().insert(node.clone());
                parent.children.lock().notify(CollectionAction::Added, &node);
                node
            }
        };
        Ok(node)
    }

    /// Creates a regular node at `path`, failing with
    /// `DataNodeExistsAlready` if a regular node already occupies it. A
    /// dummy occupying the path is promoted in place. Intermediate
    /// ancestors are resolved permissively as dummies (same as
    /// `set_value`/`add_value`'s leaf resolution), then regularized once
    /// the leaf exists.
    pub fn add_child(&self, path: &str, props: Properties) -> Result<Node> {
        if !props.is_user_only() {
            return Err(Error::Argument(
                "props",
                "administrative flags may not be set directly".into(),
            ));
        }
        let (is_absolute, tokens) = path::iter(path)?;
        let (init_tokens, leaf) = split_leaf_named(&tokens, "node")?;
        let manager = self.manager();
        let _guard = manager.sync();
        let start = self.resolve_root(is_absolute)?;
        let parent = Self::resolve_dummy_chain_unsynced(&start, init_tokens);
        let node = Self::child_add_unsynced(&parent, leaf, props)?;
        regularize_chain_unsynced(&Arc::downgrade(&parent));
        if props.is_persistent() {
            propagate_persistent_unsynced(&Arc::downgrade(&parent));
        }
        Ok(Node::from_inner(node))
    }

    /// Constructs a long-lived reference to the value at `path`, creating
    /// dummy intermediates (and a dummy leaf value of `T::default()`, if
    /// none exists) as needed.
    pub fn get_data<T>(&self, path: &str) -> Result<Reference<T>>
    where
        T: Clone + Send + Sync + PartialEq + std::fmt::Debug + Default + 'static,
    {
        let (is_absolute, tokens) = path::iter(path)?;
        let manager = self.manager();
        let base = self.resolve_root(is_absolute)?;
        let mut full_path = base.path();
        for t in &tokens {
            full_path = full_path.child(t);
        }
        Reference::new(manager, full_path)
    }

    /// Renames this node. A no-op if `new_name` already matches. Collects
    /// references below this node, unbinds them, recomputes name/path
    /// recursively, then re-anchors the references (re-creating dummy
    /// paths as needed).
    pub fn rename(&self, new_name: &str) -> Result<()> {
        if !crate::path::is_valid_name(new_name) {
            return Err(Error::Argument("new_name", "invalid name".into()));
        }
        let manager = self.manager();
        let _guard = manager.sync();
        if self.inner.name() == new_name {
            return Ok(());
        }
        let parent = self.inner.parent.lock().upgrade();
        if let Some(parent) = &parent {
            // Renaming into a name already occupied by a sibling fails,
            // whether that sibling is regular or a dummy: unlike `add`,
            // rename never promotes a dummy in its way.
            if parent.children.lock().find(new_name).is_some() {
                return Err(Error::DataNodeExistsAlready(parent.path().child(new_name)));
            }
        }
        let old_path = self.inner.path();
        let stale = manager.unregister_references_below_unsynced(&old_path);
        let new_path = parent
            .as_ref()
            .map(|p| p.path().child(new_name))
            .unwrap_or_else(PathBuf::root);
        self.inner.set_name_path_unsynced(new_name.to_string(), new_path);
        for (_, handle) in stale {
            manager.rebind_unsynced(&handle);
        }
        Ok(())
    }

    /// Deep-copies this node's subtree as a child of `dest`. On a name
    /// collision with an existing regular node: if `rename_if_collision`
    /// is set, appends `" #N"` starting at 2; otherwise fails with
    /// `DataNodeExistsAlready`. A colliding dummy is always regularized
    /// and overwritten; references on the destination side are
    /// invalidated before the overwrite and re-anchored afterward.
    pub fn copy(&self, dest: &Node, rename_if_collision: bool) -> Result<Node> {
        let manager = dest.manager();
        let _guard = manager.sync();
        let name = self.inner.name();
        let target_name = {
            let children = dest.inner.children.lock();
            let occupant = children.find(&name);
            match occupant {
                Some(n) if !n.properties().is_dummy() => {
                    if rename_if_collision {
                        children.get_new_name(&name)
                    } else {
                        return Err(Error::DataNodeExistsAlready(dest.inner.path().child(&name)));
                    }
                }
                _ => name.clone(),
            }
        };
        if let Some(existing) = dest.inner.children.lock().find(&target_name) {
            let existing_path = existing.path();
            let stale = manager.unregister_references_below_unsynced(&existing_path);
            dest.inner.children.lock().remove_by_ptr(&existing);
            let copied = self.deep_copy_unsynced(&dest.inner, &target_name);
            for (_, handle) in stale {
                manager.rebind_unsynced(&handle);
            }
            dest.inner.children.lock().notify(CollectionAction::Added, &copied);
            Ok(Node::from_inner(copied))
        } else {
            let copied = self.deep_copy_unsynced(&dest.inner, &target_name);
            dest.inner.children.lock().notify(CollectionAction::Added, &copied);
            Ok(Node::from_inner(copied))
        }
    }

    fn deep_copy_unsynced(&self, dest_parent: &Arc<NodeInner>, name: &str) -> Arc<NodeInner> {
        let path = dest_parent.path().child(name);
        let copy = NodeInner::new(
            dest_parent.manager(),
            Arc::downgrade(dest_parent),
            name.to_string(),
            path,
            self.properties(),
        );
        dest_parent.children.lock().insert(copy.clone());
        for child in self.inner.children.lock().all() {
            if child.properties().is_dummy() {
                continue;
            }
            let child_node = Node::from_inner(child.clone());
            let copied_child = child_node.deep_copy_unsynced(&copy, &child.name());
            let _ = copied_child;
        }
        for value in self.inner.values.lock().all() {
            if value.properties().is_dummy() {
                continue;
            }
            let vpath = copy.path().child(&value.name());
            let cloned = crate::value::clone_erased_unsynced(value, dest_parent.manager(), Arc::downgrade(&copy), vpath);
            copy.values.lock().insert(cloned);
        }
        copy
    }

    /// Acquires the tree lock and invokes `op` exactly once.
    pub fn execute_atomically<R>(&self, op: impl FnOnce(&Node) -> R) -> R {
        let manager = self.manager();
        let _guard = manager.sync();
        op(self)
    }

    /// Unlinks this node from its parent. The detached subtree becomes a
    /// new root with a fresh tree manager that shares the original
    /// `Sync` and serializer.
    pub fn remove(&self) -> Result<()> {
        let manager = self.manager();
        let _guard = manager.sync();
        let parent = self
            .inner
            .parent
            .lock()
            .upgrade()
            .ok_or(Error::ObjectDisposed)?;
        let old_path = self.inner.path();
        let stale = manager.unregister_references_below_unsynced(&old_path);
        parent.children.lock().remove_by_ptr(&self.inner);
        parent.children.lock().notify(CollectionAction::Removed, &self.inner);
        *self.inner.parent.lock() = Weak::new();
        let new_manager = ManagerInner::reroot_from(&manager);
        new_manager.set_root(&self.inner);
        new_manager.dispatcher().register_tree(&new_manager);
        self.inner.reassign_manager_recursive(&new_manager);
        self.inner.set_name_path_unsynced(self.inner.name(), PathBuf::root());
        for (_, handle) in stale {
            new_manager.rebind_unsynced(&handle);
        }
        Ok(())
    }

    /// Traverses the subtree (top-down), applying `(old & !clear) | set`
    /// to every node's and value's properties.
    pub fn set_properties_recursively(&self, set: Properties, clear: Properties) {
        self.inner.apply_properties_unsynced(set, clear);
        for value in self.inner.values.lock().all() {
            value.apply_write_unsynced(None, false, set, clear);
        }
        for child in self.inner.children.lock().all() {
            Node::from_inner(child.clone()).set_properties_recursively(set, clear);
        }
    }

    /// Subscribes with caller affinity (falls back to the host if no
    /// dispatch target is supplied).
    pub fn on_changed(
        &self,
        dispatch: Option<Arc<dyn Dispatch>>,
        f: impl Fn(&NodeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let target = resolve_caller_dispatch(dispatch, self.manager().dispatcher());
        self.subscribe(target, f)
    }

    /// Subscribes on the dispatcher host's dedicated worker.
    pub fn on_changed_async(&self, f: impl Fn(&NodeEvent) + Send + Sync + 'static) -> SubscriptionId {
        let target: Arc<dyn Dispatch> = Arc::new(self.manager().dispatcher().clone());
        self.subscribe(target, f)
    }

    fn subscribe(&self, dispatch: Arc<dyn Dispatch>, f: impl Fn(&NodeEvent) + Send + Sync + 'static) -> SubscriptionId {
        let _guard = self.manager().sync();
        let handler: Arc<dyn Fn(&NodeEvent) + Send + Sync> = Arc::new(f);
        let id = self.inner.listeners.lock().subscribe(dispatch.clone(), handler.clone());
        let initial = NodeEvent {
            flags: ChangeFlags::INITIAL_UPDATE,
            snapshot: self.inner.snapshot(),
        };
        dispatch.post({
            let initial = Arc::new(initial);
            Box::new(move || handler(&initial))
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.listeners.lock().unsubscribe(id);
    }

    /// Subscribes to this node's child collection. The initial replay on
    /// subscribe covers regular children only; subsequent `Added`/
    /// `Removed` events also fire for dummy children (inspect
    /// `NodeSnapshot::is_dummy` to tell them apart).
    pub fn on_children_changed(
        &self,
        dispatch: Option<Arc<dyn Dispatch>>,
        f: impl Fn(&NodeCollectionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let target = resolve_caller_dispatch(dispatch, self.manager().dispatcher());
        let _guard = self.manager().sync();
        self.inner.children.lock().subscribe(target, Arc::new(f))
    }

    pub fn unsubscribe_children(&self, id: SubscriptionId) {
        self.inner.children.lock().unsubscribe(id);
    }

    /// Subscribes to this node's value collection. The initial replay on
    /// subscribe covers regular values only; subsequent `Added`/`Removed`
    /// events also fire for dummy values (inspect `ValueSnapshot::is_dummy`
    /// to tell them apart).
    pub fn on_values_changed<T>(
        &self,
        dispatch: Option<Arc<dyn Dispatch>>,
        f: impl Fn(&crate::events::ValueCollectionEvent<T>) + Send + Sync + 'static,
    ) -> SubscriptionId
    where
        T: Clone + Send + Sync + std::fmt::Debug + 'static,
    {
        let target = resolve_caller_dispatch(dispatch, self.manager().dispatcher());
        let _guard = self.manager().sync();
        let handler = Arc::new(move |raw: &RawValueCollectionEvent| {
            if raw.value.value_type != std::any::TypeId::of::<T>() {
                return;
            }
            let payload = raw
                .value
                .payload_arc()
                .downcast::<T>()
                .expect("value_type invariant");
            let snapshot = crate::snapshot::ValueSnapshot::new(raw.value.timestamp_value(), raw.value.properties(), payload);
            f(&crate::events::ValueCollectionEvent {
                action: raw.action,
                value: snapshot,
            });
        });
        self.inner.values.lock().subscribe(target, handler)
    }

    pub fn unsubscribe_values(&self, id: SubscriptionId) {
        self.inner.values.lock().unsubscribe(id);
    }

    /// Ordered snapshot of regular children, taken under the tree lock.
    pub fn children(&self) -> Vec<Node> {
        let _guard = self.manager().sync();
        self.inner
            .children
            .lock()
            .regular_snapshot()
            .into_iter()
            .map(Node::from_inner)
            .collect()
    }

    pub fn contains_child(&self, name: &str) -> bool {
        let _guard = self.manager().sync();
        self.inner.children.lock().find_regular(name).is_some()
    }

    pub fn get_child(&self, name: &str) -> Option<Node> {
        let _guard = self.manager().sync();
        self.inner.children.lock().find_regular(name).map(Node::from_inner)
    }

    /// Removes the regular child named `name`. The removed node becomes
    /// the root of its own (detached) subtree.
    pub fn remove_child(&self, name: &str) -> Result<()> {
        let child = self
            .get_child(name)
            .ok_or_else(|| Error::Argument("name", format!("no child named `{name}`")))?;
        child.remove()
    }

    /// Removes every regular child, re-anchoring any references below
    /// them onto fresh dummy paths.
    pub fn clear_children(&self) -> Result<()> {
        self.remove_children_where(|_| true)
    }

    /// Removes every regular child matching `predicate`, re-anchoring any
    /// references below them onto fresh dummy paths. Dummies are never
    /// matched.
    pub fn remove_children_where(&self, mut predicate: impl FnMut(&Node) -> bool) -> Result<()> {
        let _guard = self.manager().sync();
        let matched = self
            .inner
            .children
            .lock()
            .remove_all(|node| predicate(&Node::from_inner(node.clone())));
        for node in matched {
            Node::from_inner(node).remove()?;
        }
        Ok(())
    }

    pub(crate) fn values_regular(&self) -> Vec<Arc<ValueInner>> {
        let _guard = self.manager().sync();
        self.inner.values.lock().regular_snapshot()
    }
}

fn split_leaf<'a>(tokens: &'a [Cow<'a, str>]) -> Result<(&'a [Cow<'a, str>], &'a str)> {
    split_leaf_named(tokens, "value")
}

fn split_leaf_named<'a>(tokens: &'a [Cow<'a, str>], what: &'static str) -> Result<(&'a [Cow<'a, str>], &'a str)> {
    match tokens.split_last() {
        Some((leaf, init)) => Ok((init, leaf.as_ref())),
        None => Err(Error::Argument("path", format!("path must name a {what}"))),
    }
}

/// Regularizes `start` and every dummy ancestor above it. Unsynced.
pub(crate) fn regularize_chain_unsynced(start: &Weak<NodeInner>) {
    let mut current = start.upgrade();
    while let Some(node) = current {
        if !node.properties().is_dummy() {
            break;
        }
        node.clear_dummy_unsynced();
        current = node.parent.lock().upgrade();
    }
}

/// Propagates `Persistent` up from `start` until an already-persistent
/// ancestor is reached. Unsynced.
pub(crate) fn propagate_persistent_unsynced(start: &Weak<NodeInner>) {
    let mut current = start.upgrade();
    while let Some(node) = current {
        if node.properties().is_persistent() {
            break;
        }
        node.set_persistent_unsynced(true);
        current = node.parent.lock().upgrade();
    }
}

/// Removes `value` from `parent`'s value collection, marking it
/// `Detached`, invalidating and re-anchoring any references bound to it.
pub(crate) fn remove_value_by_ptr(parent: &Arc<NodeInner>, value: &Arc<ValueInner>) -> Result<()> {
    let manager = parent.manager();
    let _guard = manager.sync();
    let path = value.path();
    let stale = manager.unregister_references_on_value_unsynced(&path);
    parent.values.lock().remove_by_ptr(value);
    parent.values.lock().notify(CollectionAction::Removed, value);
    value.mark_detached_unsynced();
    for handle in stale {
        manager.rebind_unsynced(&handle);
    }
    Ok(())
}

/// One periodic cleanup pass: walks the whole subtree, detaching any
/// dummy value with no references, then pruning any dummy node left
/// with no children, no values, and no references. Returns the number
/// of entries removed.
pub(crate) fn sweep_dummies_unsynced(root: &Arc<NodeInner>, referenced: &HashSet<PathBuf>) -> usize {
    sweep_node_unsynced(root, referenced)
}

fn sweep_node_unsynced(node: &Arc<NodeInner>, referenced: &HashSet<PathBuf>) -> usize {
    let mut removed = 0;
    let stale_values: Vec<Arc<ValueInner>> = node
        .values
        .lock()
        .all()
        .filter(|v| v.properties().is_dummy() && !referenced.contains(&v.path()))
        .cloned()
        .collect();
    for value in &stale_values {
        node.values.lock().remove_by_ptr(value);
        node.values.lock().notify(CollectionAction::Removed, value);
        value.mark_detached_unsynced();
        removed += 1;
        trace!(path = %value.path(), "dummy value swept");
    }

    let children: Vec<Arc<NodeInner>> = node.children.lock().all().cloned().collect();
    for child in &children {
        removed += sweep_node_unsynced(child, referenced);
    }
    let stale_children: Vec<Arc<NodeInner>> = node
        .children
        .lock()
        .all()
        .filter(|c| {
            c.properties().is_dummy()
                && !referenced.contains(&c.path())
                && c.children.lock().is_empty()
                && c.values.lock().is_empty()
        })
        .cloned()
        .collect();
    for child in &stale_children {
        node.children.lock().remove_by_ptr(child);
        node.children.lock().notify(CollectionAction::Removed, child);
        removed += 1;
        trace!(path = %child.path(), "dummy node swept");
    }
    removed
}
