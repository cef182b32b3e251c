//! Ordered container of value entries, regular and dummy interleaved in
//! insertion order. Lookup and snapshot operations surface regular
//! entries only; the change-event stream reports dummy additions and
//! removals too.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::dispatcher::Dispatch;
use crate::events::CollectionAction;
use crate::listeners::{Listeners, SubscriptionId};
use crate::properties::Properties;
use crate::value::ValueInner;

/// Outcome of a collision-checked [`ValueCollection::add_dynamically`].
pub(crate) enum AddSlot {
    /// No entry occupied the name; the caller must still construct and
    /// insert the new value.
    Empty,
    /// A dummy of the requested type occupied the name and was promoted
    /// in place; no further insertion is needed.
    Promoted(Arc<ValueInner>),
    /// A dummy of a different type occupied the name and was removed;
    /// the caller must construct and insert the replacement.
    ReplacedDummy,
    /// A regular value already occupies the name.
    Collision,
}

/// A type-erased collection event; `Value<T>::on_collection_changed`-style
/// callers downcast the payload at the subscription boundary, the same
/// pattern `value.rs` uses for per-value change events.
pub(crate) struct RawValueCollectionEvent {
    pub(crate) action: CollectionAction,
    pub(crate) value: Arc<ValueInner>,
}

pub(crate) struct ValueCollection {
    entries: Vec<Arc<ValueInner>>,
    listeners: Listeners<RawValueCollectionEvent>,
}

impl ValueCollection {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<Arc<ValueInner>> {
        self.entries.iter().find(|v| v.name() == name).cloned()
    }

    pub(crate) fn find_regular(&self, name: &str) -> Option<Arc<ValueInner>> {
        self.entries
            .iter()
            .find(|v| v.name() == name && !v.properties().is_dummy())
            .cloned()
    }

    pub(crate) fn insert(&mut self, value: Arc<ValueInner>) {
        self.entries.push(value);
    }

    pub(crate) fn remove_by_ptr(&mut self, value: &Arc<ValueInner>) -> Option<Arc<ValueInner>> {
        let idx = self.entries.iter().position(|v| Arc::ptr_eq(v, value))?;
        Some(self.entries.remove(idx))
    }

    pub(crate) fn regular_snapshot(&self) -> Vec<Arc<ValueInner>> {
        self.entries
            .iter()
            .filter(|v| !v.properties().is_dummy())
            .cloned()
            .collect()
    }

    pub(crate) fn all(&self) -> impl Iterator<Item = &Arc<ValueInner>> {
        self.entries.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn notify(&self, action: CollectionAction, value: &Arc<ValueInner>) {
        let event = RawValueCollectionEvent {
            action,
            value: value.clone(),
        };
        self.listeners.notify(Arc::new(event));
    }

    /// Type-erased collision check for adding a value named `name` of
    /// `value_type`. A regular entry of any type is a collision; a dummy
    /// of the same type is promoted in place with `payload`/`props` and
    /// returned; a dummy of a different type is removed so the caller can
    /// recreate it fresh.
    pub(crate) fn add_dynamically(
        &mut self,
        name: &str,
        value_type: TypeId,
        props: Properties,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> AddSlot {
        let existing = match self.find(name) {
            Some(existing) => existing,
            None => return AddSlot::Empty,
        };
        if !existing.properties().is_dummy() {
            return AddSlot::Collision;
        }
        if existing.value_type == value_type {
            existing.apply_write_unsynced(Some(payload), true, props, Properties::DUMMY);
            AddSlot::Promoted(existing)
        } else {
            self.remove_by_ptr(&existing);
            AddSlot::ReplacedDummy
        }
    }

    pub(crate) fn subscribe(
        &mut self,
        dispatch: Arc<dyn Dispatch>,
        handler: Arc<dyn Fn(&RawValueCollectionEvent) + Send + Sync>,
    ) -> SubscriptionId {
        let id = self.listeners.subscribe(dispatch.clone(), handler.clone());
        let snapshot = self.regular_snapshot();
        dispatch.post(Box::new(move || {
            for value in snapshot {
                handler(&RawValueCollectionEvent {
                    action: CollectionAction::InitialUpdate,
                    value,
                });
            }
        }));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) {
        self.listeners.unsubscribe(id);
    }
}
