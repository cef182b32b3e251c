//! Property-based tests over randomized tree operations.

mod support;

use std::collections::BTreeMap;

use obstree::{Properties, Serializer};
use proptest::prelude::*;
use support::{test_tree, TestSerializer};

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9]{0,7}"
}

fn path_strategy(max_depth: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(name_strategy(), 1..=max_depth)
}

fn escaped_name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop_oneof![Just('a'), Just('b'), Just('/'), Just('\\')], 1..6)
        .prop_map(|chars| chars.into_iter().collect())
}

fn build_path(segments: &[String]) -> String {
    let mut path = String::new();
    for seg in segments {
        path.push('/');
        path.push_str(seg);
    }
    path
}

proptest! {
    #[test]
    fn set_then_read_round_trips(segments in path_strategy(4), v in any::<i64>()) {
        let root = test_tree("root");
        let path = build_path(&segments);
        root.set_value(&path, v, Properties::PERSISTENT).unwrap();
        let read = root.get_data_value::<i64>(&path).unwrap().read_value().unwrap();
        prop_assert_eq!(read, v);
    }

    #[test]
    fn ancestors_become_persistent(segments in path_strategy(4), v in any::<i64>()) {
        let root = test_tree("root");
        let path = build_path(&segments);
        root.set_value(&path, v, Properties::PERSISTENT).unwrap();
        let mut prefix = String::new();
        for seg in &segments[..segments.len() - 1] {
            prefix.push('/');
            prefix.push_str(seg);
            let node = root.get_existing_node(&prefix).unwrap();
            prop_assert!(node.is_persistent());
        }
    }

    #[test]
    fn dummy_ancestors_are_invisible_until_regularized(segments in path_strategy(3)) {
        let root = test_tree("root");
        let path = build_path(&segments);
        let _reference = root.get_data::<i64>(&path).unwrap();

        let mut prefix = String::new();
        for seg in &segments[..segments.len() - 1] {
            prefix.push('/');
            prefix.push_str(seg);
            prop_assert!(root.get_existing_node(&prefix).is_err());
        }

        root.set_value(&path, 7i64, Properties::PERSISTENT).unwrap();

        prefix.clear();
        for seg in &segments[..segments.len() - 1] {
            prefix.push('/');
            prefix.push_str(seg);
            prop_assert!(root.get_existing_node(&prefix).is_ok());
        }
    }

    #[test]
    fn set_properties_recursively_is_idempotent(segments in path_strategy(3), v in any::<i64>()) {
        let root = test_tree("root");
        let path = build_path(&segments);
        root.set_value(&path, v, Properties::PERSISTENT).unwrap();

        root.set_properties_recursively(Properties::NONE, Properties::PERSISTENT);
        let once = root.get_data_value::<i64>(&path).unwrap().properties();

        root.set_properties_recursively(Properties::NONE, Properties::PERSISTENT);
        let twice = root.get_data_value::<i64>(&path).unwrap().properties();

        prop_assert_eq!(once.is_persistent(), twice.is_persistent());
        prop_assert!(!once.is_persistent());
    }

    #[test]
    fn join_then_resolve_round_trips_escaped_names(name in escaped_name_strategy()) {
        let root = test_tree("root");
        let path = obstree::join("/", &name);
        let node = root.get_data_node(&path, Properties::PERSISTENT).unwrap();
        prop_assert_eq!(node.name(), name.clone());
        let fetched = root.get_existing_node(&path).unwrap();
        prop_assert_eq!(fetched.name(), name);
    }

    #[test]
    fn serialize_round_trips_persistent_values(
        values in prop::collection::vec((name_strategy(), any::<i64>()), 1..6)
    ) {
        let root = test_tree("source");
        let mut expected: BTreeMap<String, i64> = BTreeMap::new();
        for (name, v) in &values {
            let path = format!("/{name}");
            root.set_value(&path, *v, Properties::PERSISTENT).unwrap();
            expected.insert(name.clone(), *v);
        }

        let serializer = TestSerializer;
        let mut bytes = Vec::new();
        serializer.write_tree(&root, &mut bytes).unwrap();

        let restored = test_tree("restored");
        serializer.read_tree(&mut &bytes[..], &restored).unwrap();

        for (name, v) in &expected {
            let path = format!("/{name}");
            let read = restored.get_data_value::<i64>(&path).unwrap().read_value().unwrap();
            prop_assert_eq!(read, *v);
        }
    }
}
