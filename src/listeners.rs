//! A small generic fan-out list shared by node, value, reference, and
//! collection change events.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatcher::{Dispatch, DispatcherHost};

struct Subscription<E> {
    id: u64,
    dispatch: Arc<dyn Dispatch>,
    handler: Arc<dyn Fn(&E) + Send + Sync>,
}

/// A handle returned by a `subscribe`-style call; dropping it does
/// nothing — subscriptions are not RAII-scoped in this crate, callers
/// unsubscribe explicitly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriptionId(u64);

/// An ordered, thread-safe list of event handlers, each bound to a
/// [`Dispatch`] target. Notification posts one job per handler so a
/// panicking handler is isolated from its siblings.
pub(crate) struct Listeners<E> {
    next_id: u64,
    subscribers: Vec<Subscription<E>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }
}

impl<E: Send + Sync + 'static> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. `dispatch` is `None` to request caller
    /// affinity with the host as fallback; `Some` to pin delivery to
    /// an explicit dispatch target (e.g. always the host, for
    /// `*_async` subscriptions).
    pub(crate) fn subscribe(
        &mut self,
        dispatch: Arc<dyn Dispatch>,
        handler: Arc<dyn Fn(&E) + Send + Sync>,
    ) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscription {
            id,
            dispatch,
            handler,
        });
        SubscriptionId(id)
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|s| s.id != id.0);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Posts `event` to every subscriber's dispatch target. Each
    /// subscriber gets its own clone/job, so ordering within one
    /// subscriber's target is preserved (FIFO) while cross-target
    /// ordering is not guaranteed.
    pub(crate) fn notify(&self, event: Arc<E>) {
        for sub in &self.subscribers {
            let event = event.clone();
            let handler = sub.handler.clone();
            sub.dispatch.post(Box::new(move || handler(&event)));
        }
    }
}

/// Resolves the dispatch target for a "caller-affinity" subscription: an
/// explicit target if the caller supplied one, otherwise the host worker,
/// since this crate has no ambient thread-local context to fall back to.
pub(crate) fn resolve_caller_dispatch(
    explicit: Option<Arc<dyn Dispatch>>,
    host: &DispatcherHost,
) -> Arc<dyn Dispatch> {
    explicit.unwrap_or_else(|| Arc::new(host.clone()))
}
