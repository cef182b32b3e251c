//! End-to-end scenarios exercising one tree operation each, the way a
//! caller of this crate would actually use it.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use obstree::{ChangeFlags, CollectionAction, DispatcherHost, Error, Inline, Properties, Serializer};
use support::{test_tree, TestSerializer};

#[test]
fn add_get() {
    let root = test_tree("root");
    root.set_value("/a/b/c", 42u32, Properties::PERSISTENT).unwrap();

    let a = root.get_existing_node("/a").unwrap();
    let b = root.get_existing_node("/a/b").unwrap();
    assert!(a.is_persistent());
    assert!(b.is_persistent());

    let value = root.get_data_value::<u32>("/a/b/c").unwrap();
    assert_eq!(value.read_value().unwrap(), 42);
    assert!(value.properties().is_persistent());
}

#[test]
fn reference_rebinding() {
    let root = test_tree("root");

    // Constructing the reference already auto-creates a dummy node `x`
    // and a dummy value `y` beneath it, and binds to that dummy: the
    // reference is unhealthy until a real value is written there.
    let reference = root.get_data::<String>("/x/y").unwrap();
    assert!(!reference.is_healthy());
    assert!(!reference.has_value());
    assert!(!root.contains_child("x"));

    let events: Arc<Mutex<Vec<ChangeFlags>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    reference.on_changed(Some(Arc::new(Inline)), move |e| {
        recorded.lock().unwrap().push(e.flags)
    });
    assert_eq!(events.lock().unwrap().len(), 1);
    assert!(events.lock().unwrap()[0].initial_update());

    root.set_value("/x/y", "hi".to_string(), Properties::NONE).unwrap();
    assert!(reference.is_healthy());
    assert!(reference.has_value());
    assert_eq!(reference.read_value().unwrap(), "hi");

    let seen = events.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].value());
    assert!(seen[1].is_healthy());
}

#[test]
fn dummy_cleanup() {
    let host = DispatcherHost::with_interval(Duration::from_millis(20));
    let root = obstree::new_tree("root", Properties::PERSISTENT, host, Arc::new(TestSerializer)).unwrap();

    let reference = root.get_data::<u32>("/p/q/r").unwrap();
    assert!(!reference.is_healthy());
    assert!(!root.contains_child("p"));
    drop(reference);

    std::thread::sleep(Duration::from_millis(80));

    assert!(root.get_existing_node("/p").is_err());
}

#[test]
fn copy_with_rename() {
    let root = test_tree("root");
    let src = root.get_data_node("/src", Properties::PERSISTENT).unwrap();
    src.get_data_node("a", Properties::PERSISTENT).unwrap();
    src.get_data_node("b", Properties::PERSISTENT).unwrap();

    let dest = root.get_data_node("/dest", Properties::PERSISTENT).unwrap();
    dest.get_data_node("src", Properties::PERSISTENT).unwrap();

    let copied = src.copy(&dest, true).unwrap();
    assert_eq!(copied.name(), "src #2");
    assert!(copied.get_child("a").is_some());
    assert!(copied.get_child("b").is_some());
}

#[test]
fn remove_as_reroot() {
    let root = test_tree("root");
    root.set_value("/a/b/c", 1u32, Properties::PERSISTENT).unwrap();

    let ab = root.get_existing_node("/a/b").unwrap();
    ab.remove().unwrap();

    assert!(ab.path().is_root());
    assert!(root.get_existing_node("/a/b").is_err());
    assert!(root.get_existing_node("/a").is_ok());

    let moved = ab.get_data_value::<u32>("c").unwrap();
    assert_eq!(moved.read_value().unwrap(), 1);

    let serializer = TestSerializer;
    let mut original_bytes = Vec::new();
    serializer.write_tree(&root, &mut original_bytes).unwrap();
    let mut new_root_bytes = Vec::new();
    serializer.write_tree(&ab, &mut new_root_bytes).unwrap();
    assert!(!new_root_bytes.is_empty());
}

#[test]
fn path_escape() {
    let root = test_tree("root");
    let escaped_path = obstree::join("/", "weird/name");
    root.get_data_node(&escaped_path, Properties::PERSISTENT).unwrap();
    let child = root.get_child("weird/name").unwrap();
    assert_eq!(child.path().to_escaped_string(), "/weird\\/name");

    let segments: Vec<&str> = child.path().segments().collect();
    assert_eq!(segments, vec!["weird/name"]);

    let fetched = root.get_existing_node(&escaped_path).unwrap();
    assert_eq!(fetched.name(), "weird/name");
}

#[test]
fn add_value_rejects_regular_collision_but_promotes_dummy() {
    let root = test_tree("root");
    root.add_value("/a/v", 1u32, Properties::NONE).unwrap();

    let err = root.add_value("/a/v", 2u32, Properties::NONE).unwrap_err();
    assert!(matches!(err, Error::DataValueExistsAlready(_)));
    assert_eq!(root.get_data_value::<u32>("/a/v").unwrap().read_value().unwrap(), 1);

    // A reference resolves `/a/w` as a dummy first; `add_value` then
    // promotes that dummy instead of failing.
    let reference = root.get_data::<u32>("/a/w").unwrap();
    assert!(!reference.is_healthy());
    let added = root.add_value("/a/w", 7u32, Properties::NONE).unwrap();
    assert_eq!(added.read_value().unwrap(), 7);
    assert!(reference.is_healthy());
    assert_eq!(reference.read_value().unwrap(), 7);
}

#[test]
fn add_child_rejects_regular_collision_but_promotes_dummy() {
    let root = test_tree("root");
    root.add_child("/a", Properties::NONE).unwrap();

    let err = root.add_child("/a", Properties::NONE).unwrap_err();
    assert!(matches!(err, Error::DataNodeExistsAlready(_)));

    // `/b` only exists as a dummy ancestor of a reference so far.
    let _reference = root.get_data::<u32>("/b/c").unwrap();
    assert!(!root.contains_child("b"));
    root.add_child("/b", Properties::PERSISTENT).unwrap();
    assert!(root.contains_child("b"));
    assert!(root.get_child("b").unwrap().is_persistent());
}

#[test]
fn remove_children_where_filters_and_reroots_matches() {
    let root = test_tree("root");
    root.add_child("/keep", Properties::NONE).unwrap();
    root.add_child("/drop-1", Properties::NONE).unwrap();
    root.add_child("/drop-2", Properties::NONE).unwrap();

    root.remove_children_where(|n| n.name().starts_with("drop")).unwrap();

    assert!(root.contains_child("keep"));
    assert!(!root.contains_child("drop-1"));
    assert!(!root.contains_child("drop-2"));
}

#[test]
fn child_collection_events_include_dummy_transitions() {
    let root = test_tree("root");
    let events: Arc<Mutex<Vec<(CollectionAction, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    root.on_children_changed(Some(Arc::new(Inline)), move |e| {
        recorded.lock().unwrap().push((e.action, e.node.is_dummy()))
    });

    // Resolving a reference below `/a` creates `a` as a dummy first.
    let _reference = root.get_data::<u32>("/a/b").unwrap();
    // A plain, unrelated regular child add, for contrast.
    root.add_child("/fresh", Properties::NONE).unwrap();

    let seen = events.lock().unwrap();
    assert!(seen.iter().any(|(action, is_dummy)| *action == CollectionAction::Added && *is_dummy));
    assert!(seen.iter().any(|(action, is_dummy)| *action == CollectionAction::Added && !*is_dummy));
}
