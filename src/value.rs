//! The value entity.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::trace;

use crate::dispatcher::Dispatch;
use crate::error::{Error, Result};
use crate::events::{ChangeFlags, ValueEvent};
use crate::listeners::{resolve_caller_dispatch, Listeners, SubscriptionId};
use crate::manager::ManagerInner;
use crate::node::NodeInner;
use crate::path::PathBuf;
use crate::properties::Properties;
use crate::snapshot::ValueSnapshot;

/// A type-erased change event, as stored on [`ValueInner`]; typed
/// `Value<T>` handles adapt this into a [`ValueEvent<T>`] at the
/// subscription boundary.
pub(crate) struct RawValueEvent {
    pub(crate) flags: ChangeFlags,
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) timestamp: chrono::DateTime<Utc>,
    pub(crate) properties: Properties,
    pub(crate) payload: Arc<dyn Any + Send + Sync>,
}

/// The tree-internal, type-erased value state. Owned strongly by the
/// parent node's value collection; referenced weakly by any
/// [`Reference`](crate::reference::Reference) bound to it.
pub(crate) struct ValueInner {
    pub(crate) manager: Mutex<Arc<ManagerInner>>,
    pub(crate) parent: Mutex<Weak<NodeInner>>,
    pub(crate) name: Mutex<String>,
    pub(crate) path: Mutex<PathBuf>,
    pub(crate) value_type: TypeId,
    pub(crate) properties: Mutex<Properties>,
    pub(crate) timestamp: Mutex<chrono::DateTime<Utc>>,
    pub(crate) payload: Mutex<Arc<dyn Any + Send + Sync>>,
    pub(crate) listeners: Mutex<Listeners<RawValueEvent>>,
}

impl ValueInner {
    pub(crate) fn new<T: Send + Sync + 'static>(
        manager: Arc<ManagerInner>,
        parent: Weak<NodeInner>,
        name: String,
        path: PathBuf,
        properties: Properties,
        payload: T,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager: Mutex::new(manager),
            parent: Mutex::new(parent),
            name: Mutex::new(name),
            path: Mutex::new(path),
            value_type: TypeId::of::<T>(),
            properties: Mutex::new(properties),
            timestamp: Mutex::new(Utc::now()),
            payload: Mutex::new(Arc::new(payload)),
            listeners: Mutex::new(Listeners::new()),
        })
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

    pub(crate) fn timestamp_value(&self) -> chrono::DateTime<Utc> {
        *self.timestamp.lock()
    }

    pub(crate) fn payload_arc(&self) -> Arc<dyn Any + Send + Sync> {
        self.payload.lock().clone()
    }

    /// Marks this value `Detached` (terminal) and notifies.
    pub(crate) fn mark_detached_unsynced(&self) {
        let mut props = self.properties.lock();
        *props = props.with_detached(true);
        drop(props);
        self.notify(ChangeFlags::PROPERTIES);
    }

    pub(crate) fn raw_event(&self, flags: ChangeFlags) -> RawValueEvent {
        RawValueEvent {
            flags,
            name: self.name(),
            path: self.path(),
            timestamp: *self.timestamp.lock(),
            properties: self.properties(),
            payload: self.payload.lock().clone(),
        }
    }

    /// Applies a property transform and re-point the name/path when the
    /// parent chain changes (rename cascade). Unsynced: caller must
    /// hold the tree's `Sync` guard.
    pub(crate) fn set_name_path_unsynced(&self, name: String, path: PathBuf) {
        let old_name = self.name();
        let old_path = self.path();
        *self.name.lock() = name;
        *self.path.lock() = path;
        let mut flags = ChangeFlags::NONE;
        if self.name() != old_name {
            flags |= ChangeFlags::NAME;
        }
        if self.path() != old_path {
            flags |= ChangeFlags::PATH;
        }
        if !flags.is_empty() {
            self.notify(flags);
        }
    }

    fn notify(&self, flags: ChangeFlags) {
        let event = self.raw_event(flags);
        self.listeners.lock().notify(Arc::new(event));
    }

    /// Writes a new payload and/or properties, computing the diff
    /// flag set. Unsynced: caller must hold the tree's `Sync` guard.
    ///
    /// `payload_changed` must already reflect whether the new payload
    /// differs from the old one by value (callers compare via
    /// `PartialEq` before type-erasing into `Arc<dyn Any>`).
    pub(crate) fn apply_write_unsynced(
        &self,
        payload: Option<Arc<dyn Any + Send + Sync>>,
        payload_changed: bool,
        set: Properties,
        clear: Properties,
    ) {
        let old_properties = self.properties();
        let new_properties = old_properties.apply(set, clear);
        *self.properties.lock() = new_properties;
        *self.timestamp.lock() = Utc::now();
        if let Some(payload) = payload {
            *self.payload.lock() = payload;
        }
        let diff = old_properties.diff(new_properties);
        let mut flags = ChangeFlags::TIMESTAMP;
        if diff.user_bits().any() {
            flags |= ChangeFlags::PROPERTIES;
        }
        if old_properties.is_persistent() != new_properties.is_persistent() {
            flags |= ChangeFlags::IS_PERSISTENT;
        }
        if payload_changed || old_properties.is_dummy() != new_properties.is_dummy() {
            flags |= ChangeFlags::VALUE;
        }
        trace!(path = %self.path(), ?flags, "value written");
        self.notify(flags);
    }
}

/// A named, typed, timestamped datum with properties and change events.
#[derive(Clone)]
pub struct Value<T> {
    pub(crate) inner: Arc<ValueInner>,
    _marker: PhantomData<T>,
}

impl<T: Clone + Send + Sync + PartialEq + std::fmt::Debug + 'static> Value<T> {
    pub(crate) fn from_inner(inner: Arc<ValueInner>) -> Result<Self> {
        if inner.value_type != TypeId::of::<T>() {
            return Err(Error::DataTypeMismatch {
                path: inner.path(),
                actual: inner.value_type,
                requested: TypeId::of::<T>(),
            });
        }
        Ok(Self {
            inner,
            _marker: PhantomData,
        })
    }

    /// The value's name.
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// The value's fully-resolved path.
    pub fn path(&self) -> PathBuf {
        self.inner.path()
    }

    /// The value's current properties.
    pub fn properties(&self) -> Properties {
        self.inner.properties()
    }

    /// Returns a deep copy of the payload. Fails if the value is a dummy.
    pub fn read_value(&self) -> Result<T> {
        if self.inner.properties().is_dummy() {
            return Err(Error::DataValueDoesNotExist(self.inner.path()));
        }
        Ok(self.typed_payload())
    }

    fn typed_payload(&self) -> T {
        let payload = self.inner.payload.lock().clone();
        (*payload.downcast::<T>().expect("value_type invariant")).clone()
    }

    /// Writes a new payload. Regularizes the parent chain if this value
    /// was a dummy and propagates persistence if the value is
    /// persistent. Always clears `Dummy` and refreshes the
    /// timestamp.
    pub fn write_value(&self, v: T) -> Result<()> {
        let _guard = self.inner.manager().sync();
        let changed = self.typed_payload_if_present() != Some(v.clone());
        let was_dummy = self.inner.properties().is_dummy();
        self.inner.apply_write_unsynced(
            Some(Arc::new(v)),
            changed,
            Properties::NONE,
            Properties::DUMMY,
        );
        if was_dummy {
            crate::node::regularize_chain_unsynced(&self.inner.parent.lock());
            if self.properties().is_persistent() {
                crate::node::propagate_persistent_unsynced(&self.inner.parent.lock());
            }
        }
        Ok(())
    }

    fn typed_payload_if_present(&self) -> Option<T> {
        if self.inner.properties().is_dummy() {
            None
        } else {
            Some(self.typed_payload())
        }
    }

    /// Returns the current properties, restricted to user-visible bits.
    pub fn read_properties(&self) -> Properties {
        self.properties().user_bits()
    }

    /// Overwrites the user-visible properties. Administrative bits are
    /// preserved untouched.
    pub fn write_properties(&self, props: Properties) -> Result<()> {
        if !props.is_user_only() {
            return Err(Error::Argument(
                "properties",
                "administrative flags may not be set directly".into(),
            ));
        }
        let _guard = self.inner.manager().sync();
        let was_dummy = self.inner.properties().is_dummy();
        self.inner.apply_write_unsynced(
            None,
            false,
            props,
            crate::properties::USER_MASK | Properties::DUMMY,
        );
        if was_dummy {
            crate::node::regularize_chain_unsynced(&self.inner.parent.lock());
            if props.is_persistent() {
                crate::node::propagate_persistent_unsynced(&self.inner.parent.lock());
            }
        }
        Ok(())
    }

    /// Returns true iff `Persistent` is set.
    pub fn is_persistent(&self) -> bool {
        self.properties().is_persistent()
    }

    /// Sets or clears `Persistent`, regularizing and propagating the
    /// parent chain as needed.
    pub fn set_persistent(&self, on: bool) -> Result<()> {
        if on {
            self.write_properties(Properties::PERSISTENT)
        } else {
            let _guard = self.inner.manager().sync();
            self.inner.apply_write_unsynced(
                None,
                false,
                Properties::NONE,
                Properties::PERSISTENT,
            );
            Ok(())
        }
    }

    /// Atomically writes payload and properties in one step. When a flag
    /// appears in both `to_set` and `to_clear`, "set" wins. Clears
    /// `Dummy` unless `to_set` explicitly reasserts it.
    pub fn set(&self, v: T, to_set: Properties, to_clear: Properties) -> Result<()> {
        let allowed = crate::properties::USER_MASK | Properties::DUMMY;
        if (to_set & !allowed).any() {
            return Err(Error::Argument(
                "to_set",
                "administrative flags other than Dummy may not be set directly".into(),
            ));
        }
        let _guard = self.inner.manager().sync();
        let changed = self.typed_payload_if_present() != Some(v.clone());
        let was_dummy = self.inner.properties().is_dummy();
        // `apply` already lets `set` win over `clear` bit-for-bit, so
        // asserting Dummy via `to_set` overrides this unconditional clear.
        let clear = to_clear | Properties::DUMMY;
        self.inner
            .apply_write_unsynced(Some(Arc::new(v)), changed, to_set, clear);
        if was_dummy && !self.inner.properties().is_dummy() {
            crate::node::regularize_chain_unsynced(&self.inner.parent.lock());
            if self.properties().is_persistent() {
                crate::node::propagate_persistent_unsynced(&self.inner.parent.lock());
            }
        }
        Ok(())
    }

    /// Removes this value from its parent node. Acceptable for dummy
    /// values at internal (reference-reachable) paths. Sets `Detached`
    /// on the detached instance, a terminal state.
    pub fn remove(&self) -> Result<()> {
        let parent = self
            .inner
            .parent
            .lock()
            .upgrade()
            .ok_or(Error::ObjectDisposed)?;
        crate::node::remove_value_by_ptr(&parent, &self.inner)
    }

    /// Subscribes with caller affinity (falls back to the host if no
    /// dispatch target is supplied). Delivers an initial snapshot
    /// immediately, under the tree lock.
    pub fn on_changed(
        &self,
        dispatch: Option<Arc<dyn Dispatch>>,
        f: impl Fn(&ValueEvent<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let target = resolve_caller_dispatch(dispatch, self.inner.manager().dispatcher());
        self.subscribe(target, f)
    }

    /// Subscribes on the dispatcher host's dedicated worker.
    pub fn on_changed_async(
        &self,
        f: impl Fn(&ValueEvent<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let target: Arc<dyn Dispatch> = Arc::new(self.inner.manager().dispatcher().clone());
        self.subscribe(target, f)
    }

    fn subscribe(
        &self,
        dispatch: Arc<dyn Dispatch>,
        f: impl Fn(&ValueEvent<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let _guard = self.inner.manager().sync();
        let handler = Arc::new(move |raw: &RawValueEvent| {
            let payload = raw
                .payload
                .clone()
                .downcast::<T>()
                .expect("value_type invariant");
            let snapshot = ValueSnapshot::new(raw.timestamp, raw.properties, payload);
            f(&ValueEvent {
                flags: raw.flags,
                snapshot,
            });
        });
        let id = self
            .inner
            .listeners
            .lock()
            .subscribe(dispatch.clone(), handler.clone());
        let initial = self.inner.raw_event(ChangeFlags::INITIAL_UPDATE);
        dispatch.post({
            let initial = Arc::new(initial);
            Box::new(move || handler(&initial))
        });
        id
    }

    /// Unsubscribes a previously registered handler.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.listeners.lock().unsubscribe(id);
    }
}

/// Builds an independent value entry sharing `source`'s current payload
/// (safe: writes always install a fresh `Arc`, never mutate through an
/// existing one) under a new parent/path, used by `Node::copy`.
pub(crate) fn clone_erased_unsynced(
    source: &Arc<ValueInner>,
    manager: Arc<ManagerInner>,
    parent: Weak<NodeInner>,
    path: PathBuf,
) -> Arc<ValueInner> {
    Arc::new(ValueInner {
        manager: Mutex::new(manager),
        parent: Mutex::new(parent),
        name: Mutex::new(source.name()),
        path: Mutex::new(path),
        value_type: source.value_type,
        properties: Mutex::new(source.properties()),
        timestamp: Mutex::new(source.timestamp_value()),
        payload: Mutex::new(source.payload_arc()),
        listeners: Mutex::new(Listeners::new()),
    })
}
