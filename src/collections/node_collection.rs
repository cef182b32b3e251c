//! Ordered container of child node entries, regular and dummy interleaved
//! in insertion order. Lookup and snapshot operations surface regular
//! entries only; the change-event stream reports dummy additions and
//! removals too, since those are first-class state transitions in their
//! own right.

use std::sync::Arc;

use crate::dispatcher::Dispatch;
use crate::events::{CollectionAction, NodeCollectionEvent};
use crate::listeners::{Listeners, SubscriptionId};
use crate::node::NodeInner;
use crate::snapshot::NodeSnapshot;

pub(crate) struct NodeCollection {
    entries: Vec<Arc<NodeInner>>,
    listeners: Listeners<NodeCollectionEvent>,
}

impl NodeCollection {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<Arc<NodeInner>> {
        self.entries.iter().find(|n| n.name() == name).cloned()
    }

    pub(crate) fn find_regular(&self, name: &str) -> Option<Arc<NodeInner>> {
        self.entries
            .iter()
            .find(|n| n.name() == name && !n.properties().is_dummy())
            .cloned()
    }

    /// A name is available for a new regular entry if nothing occupies it,
    /// or if the occupant is a dummy (which a new regular entry promotes).
    pub(crate) fn name_available(&self, name: &str) -> bool {
        match self.find(name) {
            None => true,
            Some(n) => n.properties().is_dummy(),
        }
    }

    pub(crate) fn insert(&mut self, node: Arc<NodeInner>) {
        self.entries.push(node);
    }

    pub(crate) fn remove_by_ptr(&mut self, node: &Arc<NodeInner>) -> Option<Arc<NodeInner>> {
        let idx = self.entries.iter().position(|n| Arc::ptr_eq(n, node))?;
        Some(self.entries.remove(idx))
    }

    pub(crate) fn regular_snapshot(&self) -> Vec<Arc<NodeInner>> {
        self.entries
            .iter()
            .filter(|n| !n.properties().is_dummy())
            .cloned()
            .collect()
    }

    pub(crate) fn all(&self) -> impl Iterator<Item = &Arc<NodeInner>> {
        self.entries.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Smallest-available-suffix name generator: `base` itself if
    /// unused or dummy, else `"{base} #k"` for the smallest `k >= 2` whose
    /// name is unused or dummy.
    pub(crate) fn get_new_name(&self, base: &str) -> String {
        if self.name_available(base) {
            return base.to_string();
        }
        let mut k = 2u32;
        loop {
            let candidate = format!("{base} #{k}");
            if self.name_available(&candidate) {
                return candidate;
            }
            k += 1;
        }
    }

    pub(crate) fn notify(&self, action: CollectionAction, node: &NodeInner) {
        let event = NodeCollectionEvent {
            action,
            node: node.snapshot(),
        };
        self.listeners.notify(Arc::new(event));
    }

    /// Removes every regular entry matching `predicate`, returning the
    /// matched entries in their original order. Dummies are never
    /// candidates: bulk removal is a user-facing operation and dummies
    /// are not user-visible state.
    pub(crate) fn remove_all(
        &mut self,
        mut predicate: impl FnMut(&Arc<NodeInner>) -> bool,
    ) -> Vec<Arc<NodeInner>> {
        let matched: Vec<Arc<NodeInner>> = self
            .entries
            .iter()
            .filter(|n| !n.properties().is_dummy() && predicate(n))
            .cloned()
            .collect();
        for node in &matched {
            self.remove_by_ptr(node);
        }
        matched
    }

    pub(crate) fn subscribe(
        &mut self,
        dispatch: Arc<dyn Dispatch>,
        handler: Arc<dyn Fn(&NodeCollectionEvent) + Send + Sync>,
    ) -> SubscriptionId {
        let id = self.listeners.subscribe(dispatch.clone(), handler.clone());
        let snapshot: Vec<NodeSnapshot> = self
            .regular_snapshot()
            .iter()
            .map(|n| n.snapshot())
            .collect();
        dispatch.post(Box::new(move || {
            for node in snapshot {
                handler(&NodeCollectionEvent {
                    action: CollectionAction::InitialUpdate,
                    node,
                });
            }
        }));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) {
        self.listeners.unsubscribe(id);
    }
}
