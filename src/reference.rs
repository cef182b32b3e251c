//! The reference entity: a long-lived typed handle to the value at a
//! fixed path that auto-rebinds across destroy/create cycles.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::dispatcher::{Dispatch, Inline};
use crate::error::{Error, Result};
use crate::events::{ChangeFlags, ReferenceEvent};
use crate::listeners::{resolve_caller_dispatch, Listeners, SubscriptionId};
use crate::manager::{ManagerInner, ReferenceHandle, RegistrationId};
use crate::node::NodeInner;
use crate::path::PathBuf;
use crate::properties::Properties;
use crate::snapshot::ReferenceSnapshot;
use crate::value::{RawValueEvent, Value, ValueInner};

struct Binding {
    value: Arc<ValueInner>,
    sub_id: SubscriptionId,
}

struct Mirror<T> {
    timestamp: DateTime<Utc>,
    properties: Properties,
    is_healthy: bool,
    payload: Option<Arc<T>>,
}

impl<T> Mirror<T> {
    fn broken() -> Self {
        Self {
            timestamp: Utc::now(),
            properties: Properties::NONE,
            is_healthy: false,
            payload: None,
        }
    }
}

pub(crate) struct ReferenceInner<T> {
    manager: Arc<ManagerInner>,
    path: PathBuf,
    self_weak: Mutex<Weak<ReferenceInner<T>>>,
    mirror: Mutex<Mirror<T>>,
    binding: Mutex<Option<Binding>>,
    reg_id: Mutex<Option<RegistrationId>>,
    disposed: Mutex<bool>,
    listeners: Mutex<Listeners<ReferenceEvent<T>>>,
}

impl<T> ReferenceHandle for ReferenceInner<T>
where
    T: Clone + Send + Sync + PartialEq + std::fmt::Debug + Default + 'static,
{
    fn path(&self) -> &PathBuf {
        &self.path
    }

    fn invalidate_unsynced(&self) {
        self.unbind_unsynced(true);
    }

    fn update_unsynced(&self, root: &Arc<NodeInner>) {
        if *self.disposed.lock() {
            return;
        }
        let segments: Vec<String> = self.path.segments().map(str::to_string).collect();
        let (init, leaf) = match segments.split_last() {
            Some((leaf, init)) => (init.to_vec(), leaf.clone()),
            None => return,
        };
        let mut current = root.clone();
        for name in &init {
            current = crate::node::Node::child_dummy_unsynced(&current, name);
        }
        let value = crate::node::Node::value_or_create_unsynced(&current, &leaf, Properties::DUMMY, T::default);
        if value.value_type != std::any::TypeId::of::<T>() {
            self.unbind_unsynced(true);
            return;
        }
        if let Some(existing) = &*self.binding.lock() {
            if Arc::ptr_eq(&existing.value, &value) {
                return;
            }
        }
        self.bind_to_unsynced(value);
    }

    fn set_registration_unsynced(&self, id: RegistrationId) {
        *self.reg_id.lock() = Some(id);
    }
}

impl<T> ReferenceInner<T>
where
    T: Clone + Send + Sync + PartialEq + std::fmt::Debug + Default + 'static,
{
    fn notify(&self, flags: ChangeFlags, snapshot: ReferenceSnapshot<T>) {
        if flags.is_empty() {
            return;
        }
        let event = ReferenceEvent { flags, snapshot };
        self.listeners.lock().notify(Arc::new(event));
    }

    fn snapshot(&self) -> ReferenceSnapshot<T> {
        let name = self.path.name().unwrap_or_default().to_string();
        let mirror = self.mirror.lock();
        if let Some(payload) = &mirror.payload {
            ReferenceSnapshot::healthy(
                name,
                self.path.clone(),
                mirror.timestamp,
                mirror.properties,
                payload.clone(),
            )
        } else {
            ReferenceSnapshot::broken(name, self.path.clone())
        }
    }

    fn unbind_unsynced(&self, emit: bool) {
        let previous = self.binding.lock().take();
        if let Some(binding) = previous {
            binding.value.listeners.lock().unsubscribe(binding.sub_id);
        }
        let was_healthy = self.mirror.lock().is_healthy;
        *self.mirror.lock() = Mirror::broken();
        if emit && was_healthy {
            self.notify(ChangeFlags::IS_HEALTHY, self.snapshot());
        }
    }

    fn bind_to_unsynced(&self, value: Arc<ValueInner>) {
        self.unbind_unsynced(false);
        let weak_self = self.self_weak.lock().clone();
        let handler: Arc<dyn Fn(&RawValueEvent) + Send + Sync> = Arc::new(move |raw: &RawValueEvent| {
            if let Some(this) = weak_self.upgrade() {
                this.on_value_event(raw);
            }
        });
        let sub_id = value
            .listeners
            .lock()
            .subscribe(Arc::new(Inline), handler.clone());
        let initial = value.raw_event(ChangeFlags::NONE);
        *self.binding.lock() = Some(Binding { value, sub_id });
        handler(&initial);
    }

    fn on_value_event(&self, raw: &RawValueEvent) {
        // Health tracks "bound to a regular value", not merely "bound to
        // something": a reference resting on a self-created dummy is
        // unhealthy until that dummy is promoted by a real write.
        let is_healthy = !raw.properties.is_dummy();
        let payload = if is_healthy {
            Some(
                raw.payload
                    .clone()
                    .downcast::<T>()
                    .expect("value_type invariant"),
            )
        } else {
            None
        };
        let was_healthy = self.mirror.lock().is_healthy;
        let was_props = self.mirror.lock().properties;
        *self.mirror.lock() = Mirror {
            timestamp: raw.timestamp,
            properties: raw.properties,
            is_healthy,
            payload,
        };
        let mut flags = ChangeFlags::VALUE | ChangeFlags::TIMESTAMP;
        if was_props.diff(raw.properties).user_bits().any() {
            flags |= ChangeFlags::PROPERTIES;
        }
        if was_props.is_persistent() != raw.properties.is_persistent() {
            flags |= ChangeFlags::IS_PERSISTENT;
        }
        if was_healthy != is_healthy {
            flags |= ChangeFlags::IS_HEALTHY;
        }
        self.notify(flags, self.snapshot());
    }
}

/// A long-lived typed handle to the value at a fixed path; rebinds
/// automatically whenever the target is destroyed and later recreated.
#[derive(Clone)]
pub struct Reference<T> {
    inner: Arc<ReferenceInner<T>>,
}

impl<T> Reference<T>
where
    T: Clone + Send + Sync + PartialEq + std::fmt::Debug + Default + 'static,
{
    /// Constructs a reference to `path`, resolving (creating dummies as
    /// needed) and registering with the tree manager under `Sync`.
    pub(crate) fn new(manager: Arc<ManagerInner>, path: PathBuf) -> Result<Self> {
        if path.is_root() {
            return Err(Error::Argument("path", "a reference cannot name the root".into()));
        }
        let _guard = manager.sync();
        let inner = Arc::new(ReferenceInner {
            manager: manager.clone(),
            path: path.clone(),
            self_weak: Mutex::new(Weak::new()),
            mirror: Mutex::new(Mirror::broken()),
            binding: Mutex::new(None),
            reg_id: Mutex::new(None),
            disposed: Mutex::new(false),
            listeners: Mutex::new(Listeners::new()),
        });
        *inner.self_weak.lock() = Arc::downgrade(&inner);
        let handle: Weak<dyn ReferenceHandle> = Arc::downgrade(&inner);
        let reg_id = manager.register_reference_unsynced(path, handle);
        *inner.reg_id.lock() = Some(reg_id);
        Ok(Self { inner })
    }

    /// The referenced value's name (the last path segment).
    pub fn name(&self) -> String {
        self.inner.path.name().unwrap_or_default().to_string()
    }

    /// The reference's fixed path.
    pub fn path(&self) -> PathBuf {
        self.inner.path.clone()
    }

    /// Mirrored last-write timestamp of the bound value, or the moment
    /// the binding broke.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.mirror.lock().timestamp
    }

    /// Mirrored properties of the bound value.
    pub fn properties(&self) -> Properties {
        self.inner.mirror.lock().properties
    }

    /// True iff currently bound to a regular (non-dummy) value. A
    /// reference freshly pointed at a path with nothing there, or one
    /// whose target was just removed, is unhealthy until a real value
    /// shows up at that path.
    pub fn is_healthy(&self) -> bool {
        self.inner.mirror.lock().is_healthy
    }

    /// Equivalent to [`Reference::is_healthy`]: a healthy binding is
    /// always to a non-dummy value.
    pub fn has_value(&self) -> bool {
        self.inner.mirror.lock().is_healthy
    }

    /// Returns true iff `Persistent` is set on the bound value.
    pub fn is_persistent(&self) -> bool {
        self.properties().is_persistent()
    }

    fn bound_value(&self) -> Result<Value<T>> {
        let binding = self.inner.binding.lock();
        match &*binding {
            Some(b) => Value::from_inner(b.value.clone()),
            None => Err(Error::DataValueReferenceBroken(self.inner.path.clone())),
        }
    }

    /// Returns a deep copy of the mirrored payload. Fails with
    /// `ObjectDisposed` if disposed, `DataValueReferenceBroken` if
    /// unhealthy, `DataValueDoesNotExist` if the bound value is dummy.
    pub fn read_value(&self) -> Result<T> {
        if *self.inner.disposed.lock() {
            return Err(Error::ObjectDisposed);
        }
        self.bound_value()?.read_value()
    }

    /// Writes a new payload to the bound value. Requires a healthy
    /// binding.
    pub fn write_value(&self, v: T) -> Result<()> {
        self.bound_value()?.write_value(v)
    }

    /// Overwrites the bound value's user-visible properties. Requires a
    /// healthy binding.
    pub fn write_properties(&self, props: Properties) -> Result<()> {
        self.bound_value()?.write_properties(props)
    }

    /// Sets or clears `Persistent` on the bound value. Requires a healthy
    /// binding.
    pub fn set_persistent(&self, on: bool) -> Result<()> {
        self.bound_value()?.set_persistent(on)
    }

    /// Atomically writes payload and properties on the bound value.
    /// Requires a healthy binding.
    pub fn set(&self, v: T, to_set: Properties, to_clear: Properties) -> Result<()> {
        self.bound_value()?.set(v, to_set, to_clear)
    }

    /// Subscribes with caller affinity (falls back to the host if no
    /// dispatch target is supplied). Delivers an initial snapshot
    /// immediately, under the tree lock.
    pub fn on_changed(
        &self,
        dispatch: Option<Arc<dyn Dispatch>>,
        f: impl Fn(&ReferenceEvent<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let target = resolve_caller_dispatch(dispatch, self.inner.manager.dispatcher());
        self.subscribe(target, f)
    }

    /// Subscribes on the dispatcher host's dedicated worker.
    pub fn on_changed_async(&self, f: impl Fn(&ReferenceEvent<T>) + Send + Sync + 'static) -> SubscriptionId {
        let target: Arc<dyn Dispatch> = Arc::new(self.inner.manager.dispatcher().clone());
        self.subscribe(target, f)
    }

    fn subscribe(&self, dispatch: Arc<dyn Dispatch>, f: impl Fn(&ReferenceEvent<T>) + Send + Sync + 'static) -> SubscriptionId {
        let _guard = self.inner.manager.sync();
        let handler: Arc<dyn Fn(&ReferenceEvent<T>) + Send + Sync> = Arc::new(f);
        let id = self.inner.listeners.lock().subscribe(dispatch.clone(), handler.clone());
        let snapshot = self.inner.snapshot();
        dispatch.post(Box::new(move || {
            handler(&ReferenceEvent {
                flags: ChangeFlags::INITIAL_UPDATE,
                snapshot,
            })
        }));
        id
    }

    /// Unsubscribes a previously registered handler.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.listeners.lock().unsubscribe(id);
    }

    /// Unsubscribes from the bound value and unregisters from the tree
    /// manager. Idempotent.
    pub fn dispose(&self) {
        let mut disposed = self.inner.disposed.lock();
        if *disposed {
            return;
        }
        *disposed = true;
        drop(disposed);
        let _guard = self.inner.manager.sync();
        self.inner.unbind_unsynced(false);
        if let Some(reg_id) = self.inner.reg_id.lock().take() {
            self.inner
                .manager
                .unregister_reference_unsynced(&self.inner.path, reg_id);
        }
    }
}

impl<T> Drop for ReferenceInner<T> {
    fn drop(&mut self) {
        if let Some(reg_id) = self.reg_id.lock().take() {
            self.manager.unregister_reference_unsynced(&self.path, reg_id);
        }
    }
}
