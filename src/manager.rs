//! The tree manager: per-tree lock, serializer handle, reference registry,
//! and dummy cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::trace;

use crate::dispatcher::DispatcherHost;
use crate::node::NodeInner;
use crate::path::PathBuf;
use crate::serializer::Serializer;

/// An object-safe view of a typed `Reference<T>`, used by the manager's
/// registry so it does not need to be generic over every bound type.
pub(crate) trait ReferenceHandle: Send + Sync {
    fn path(&self) -> &PathBuf;
    /// Clears the binding. Unsynced: caller must hold `Sync`.
    fn invalidate_unsynced(&self);
    /// Resolves (creating dummies as needed) and rebinds to the value
    /// currently at `path`, starting from `root`. Unsynced.
    fn update_unsynced(&self, root: &Arc<NodeInner>);
    /// Records the registry token this handle was most recently inserted
    /// under, so a later unregister can find the right bucket entry even
    /// after a rebind moved it to a freshly allocated one.
    fn set_registration_unsynced(&self, id: RegistrationId);
}

struct Bucket {
    handles: Vec<(u64, Weak<dyn ReferenceHandle>)>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }
}

/// Registration token returned by [`ManagerInner::register_reference`];
/// callers hold it to later unregister the same handle.
#[derive(Clone, Copy)]
pub(crate) struct RegistrationId(u64);

/// Per-tree state shared by every node, value, and reference in one tree:
/// the re-entrant lock that serializes mutation, the injected serializer,
/// the dispatcher host, and the path-keyed reference registry.
pub(crate) struct ManagerInner {
    sync_lock: ReentrantMutex<()>,
    root: Mutex<Weak<NodeInner>>,
    dispatcher: DispatcherHost,
    serializer: Arc<dyn Serializer>,
    references: Mutex<HashMap<PathBuf, Bucket>>,
    generation: AtomicU64,
}

impl ManagerInner {
    pub(crate) fn new(dispatcher: DispatcherHost, serializer: Arc<dyn Serializer>) -> Arc<Self> {
        Arc::new(Self {
            sync_lock: ReentrantMutex::new(()),
            root: Mutex::new(Weak::new()),
            dispatcher,
            serializer,
            references: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Creates a manager for a subtree detached from an existing tree: the
    /// new root keeps the original `Sync` and dispatcher, per the
    /// "detaching reroots with a fresh manager sharing the lock" rule.
    pub(crate) fn reroot_from(original: &Arc<ManagerInner>) -> Arc<Self> {
        Arc::new(Self {
            sync_lock: ReentrantMutex::new(()),
            root: Mutex::new(Weak::new()),
            dispatcher: original.dispatcher.clone(),
            serializer: original.serializer.clone(),
            references: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Acquires the tree's coarse re-entrant lock.
    pub(crate) fn sync(&self) -> ReentrantMutexGuard<'_, ()> {
        self.sync_lock.lock()
    }

    pub(crate) fn dispatcher(&self) -> &DispatcherHost {
        &self.dispatcher
    }

    pub(crate) fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub(crate) fn root(&self) -> Option<Arc<NodeInner>> {
        self.root.lock().upgrade()
    }

    pub(crate) fn set_root(&self, node: &Arc<NodeInner>) {
        *self.root.lock() = Arc::downgrade(node);
    }

    /// True while the root is still alive; returned to the dispatcher's
    /// sweep so it can drop trees whose root has been collected.
    pub(crate) fn has_live_root(&self) -> bool {
        self.root.lock().upgrade().is_some()
    }

    /// Allocates a registry-wide unique id. Ids are never reused across a
    /// manager's lifetime, so a stale [`RegistrationId`] held past a
    /// rebind can never collide with a different reference's entry.
    fn next_registration_id(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `weak` into `path`'s bucket under a freshly allocated id.
    fn insert_bucket_unsynced(&self, path: PathBuf, weak: Weak<dyn ReferenceHandle>) -> RegistrationId {
        let id = self.next_registration_id();
        let mut registry = self.references.lock();
        registry.entry(path).or_insert_with(Bucket::new).handles.push((id, weak));
        RegistrationId(id)
    }

    /// Inserts a weak handle into `path`'s bucket and immediately resolves
    /// (creating dummies as needed) against the current root. Unsynced.
    pub(crate) fn register_reference_unsynced(
        &self,
        path: PathBuf,
        handle: Weak<dyn ReferenceHandle>,
    ) -> RegistrationId {
        let id = self.insert_bucket_unsynced(path, handle.clone());
        if let (Some(root), Some(strong)) = (self.root(), handle.upgrade()) {
            strong.update_unsynced(&root);
        }
        id
    }

    /// Removes a previously registered handle. If its bucket becomes
    /// empty, the value at `path` is a candidate for dummy cleanup on the
    /// next periodic sweep.
    pub(crate) fn unregister_reference_unsynced(&self, path: &PathBuf, id: RegistrationId) {
        let mut registry = self.references.lock();
        if let Some(bucket) = registry.get_mut(path) {
            bucket.handles.retain(|(bid, _)| *bid != id.0);
            if bucket.handles.is_empty() {
                registry.remove(path);
            }
        }
    }

    /// Invalidates and unregisters every reference bound at exactly
    /// `path`, returning their handles so the caller can re-anchor them
    /// (typically via [`Self::rebind_unsynced`]) once the structural
    /// mutation that triggered this call has completed.
    pub(crate) fn unregister_references_on_value_unsynced(
        &self,
        path: &PathBuf,
    ) -> Vec<Arc<dyn ReferenceHandle>> {
        let handles = self
            .references
            .lock()
            .remove(path)
            .map(|b| b.handles)
            .unwrap_or_default();
        let mut live = Vec::new();
        for (_, weak) in handles {
            if let Some(strong) = weak.upgrade() {
                strong.invalidate_unsynced();
                live.push(strong);
            }
        }
        live
    }

    /// Same as [`Self::unregister_references_on_value_unsynced`] but for
    /// every registered path at or below `prefix` (a node being removed
    /// and its whole subtree).
    pub(crate) fn unregister_references_below_unsynced(
        &self,
        prefix: &PathBuf,
    ) -> Vec<(PathBuf, Arc<dyn ReferenceHandle>)> {
        let mut registry = self.references.lock();
        let affected: Vec<PathBuf> = registry
            .keys()
            .filter(|p| prefix.is_ancestor_of(p))
            .cloned()
            .collect();
        let mut out = Vec::new();
        for path in affected {
            if let Some(bucket) = registry.remove(&path) {
                for (_, weak) in bucket.handles {
                    if let Some(strong) = weak.upgrade() {
                        out.push((path.clone(), strong));
                    }
                }
            }
        }
        drop(registry);
        for (_, handle) in &out {
            handle.invalidate_unsynced();
        }
        out
    }

    /// Invalidates bindings at `path` without unregistering them, used
    /// when a dummy value is being replaced by an incompatible type: the
    /// old references must see the destroy, but stay registered so a
    /// later value of their own type can still rebind them.
    pub(crate) fn invalidate_references_at_unsynced(&self, path: &PathBuf) {
        if let Some(bucket) = self.references.lock().get(path) {
            for (_, weak) in &bucket.handles {
                if let Some(strong) = weak.upgrade() {
                    strong.invalidate_unsynced();
                }
            }
        }
    }

    /// Re-anchors `handle` against the current root: reinserts it into
    /// this manager's registry under a fresh id (the structural mutation
    /// that preceded this call removed its old bucket entry) and resolves
    /// (creating dummies as needed), binding it to whatever now exists at
    /// its path.
    pub(crate) fn rebind_unsynced(&self, handle: &Arc<dyn ReferenceHandle>) {
        let weak: Weak<dyn ReferenceHandle> = Arc::downgrade(handle);
        let id = self.insert_bucket_unsynced(handle.path().clone(), weak);
        handle.set_registration_unsynced(id);
        if let Some(root) = self.root() {
            handle.update_unsynced(&root);
        }
    }

    /// Gives every handle currently registered at `path` another chance to
    /// bind against whatever now lives there, without touching the
    /// registry. Used after a value is created or replaced at a path that
    /// may still hold references left dormant by
    /// [`Self::invalidate_references_at_unsynced`] (a dummy replaced by an
    /// incompatible type): those of the newly-created value's own type
    /// can now rebind; others simply stay unhealthy.
    pub(crate) fn retry_bucket_unsynced(&self, path: &PathBuf) {
        let handles: Vec<Weak<dyn ReferenceHandle>> = match self.references.lock().get(path) {
            Some(bucket) => bucket.handles.iter().map(|(_, w)| w.clone()).collect(),
            None => return,
        };
        if let Some(root) = self.root() {
            for weak in handles {
                if let Some(strong) = weak.upgrade() {
                    strong.update_unsynced(&root);
                }
            }
        }
    }

    /// Runs one cleanup pass: prunes dead handles from every bucket, and
    /// for any bucket that is now empty, detaches its dummy value (if the
    /// value at that path still exists and is a dummy with no children or
    /// values of its own) and walks the parent chain pruning now-empty
    /// dummy ancestors. Returns false once the root itself is gone, at
    /// which point the dispatcher drops this tree from its sweep set.
    pub(crate) fn check_periodically(self: &Arc<Self>) -> bool {
        let _guard = self.sync();
        let root = match self.root() {
            Some(root) => root,
            None => return false,
        };
        self.references.lock().retain(|_, bucket| {
            bucket.handles.retain(|(_, weak)| weak.strong_count() > 0);
            !bucket.handles.is_empty()
        });
        let referenced: std::collections::HashSet<PathBuf> =
            self.references.lock().keys().cloned().collect();
        let removed = crate::node::sweep_dummies_unsynced(&root, &referenced);
        trace!(count = removed, "dummy sweep removed entries");
        true
    }
}
