//! End-to-end engine flow: store mutations propagate through a registered
//! query into a routed merge target in one call.

use canopy::prelude::*;
use canopy_core::query::ProjId;

#[test]
fn mutations_flow_through_query_into_merge_target() {
    let mut engine = Engine::new();

    let path_a = engine.path(&["a"]).unwrap();
    let path_m = engine.path(&["m"]).unwrap();

    let root = engine.add_intersection();
    let term = engine.add_terminal(
        path_a,
        ValuePredicate::Eq(NodeValue::Int(1)),
        false,
    );
    engine.attach(root, term);
    engine.refresh(root).unwrap();
    let result = engine.register_result(root);

    let target = engine.add_merge_target();
    engine
        .add_mapping(
            target,
            result,
            ProjId::MATCHES,
            &MappingSpec::selection(vec![(path_m, path_a)], Priority(1)),
        )
        .unwrap();

    // a matching row lands in the merge target synchronously
    let row = engine.insert(None, &[], NodeEntry::attributes()).unwrap();
    let leaf = engine
        .insert(Some(row), &["a"], NodeEntry::terminal(NodeValue::Int(1)))
        .unwrap();
    let _miss = engine
        .insert(Some(row), &["a"], NodeEntry::terminal(NodeValue::Int(2)))
        .unwrap();

    assert_eq!(engine.matches(root), vec![leaf]);
    {
        let target_store = engine.target(target).unwrap().target();
        let target_store = target_store.borrow();
        let mapped = target_store.elements_at_path(path_m);
        assert_eq!(mapped.len(), 1);
        assert_eq!(
            target_store.element(mapped[0]).and_then(|el| el.source_id),
            Some(leaf)
        );
    }

    // removing the row unwinds the target just as synchronously
    engine.remove(row).unwrap();
    assert!(engine.matches(root).is_empty());
    assert_eq!(
        engine
            .target(target)
            .unwrap()
            .target()
            .borrow()
            .element_count(),
        0
    );
}

#[test]
fn registered_mapping_is_seeded_with_current_matches() {
    let mut engine = Engine::new();

    let path_a = engine.path(&["a"]).unwrap();
    let path_m = engine.path(&["m"]).unwrap();

    let root = engine.add_intersection();
    let term = engine.add_terminal(
        path_a,
        ValuePredicate::Eq(NodeValue::Int(1)),
        false,
    );
    engine.attach(root, term);
    engine.refresh(root).unwrap();
    let result = engine.register_result(root);

    // data exists before the mapping is registered
    let row = engine.insert(None, &[], NodeEntry::attributes()).unwrap();
    let leaf = engine
        .insert(Some(row), &["a"], NodeEntry::terminal(NodeValue::Int(1)))
        .unwrap();

    let target = engine.add_merge_target();
    engine
        .add_mapping(
            target,
            result,
            ProjId::MATCHES,
            &MappingSpec::selection(vec![(path_m, path_a)], Priority(1)),
        )
        .unwrap();

    let target_store = engine.target(target).unwrap().target();
    let target_store = target_store.borrow();
    let mapped = target_store.elements_at_path(path_m);
    assert_eq!(mapped.len(), 1);
    assert_eq!(
        target_store.element(mapped[0]).and_then(|el| el.source_id),
        Some(leaf)
    );

    // the target store is observable through the diagnostics surface
    let report = canopy::obs::storage_report(&target_store);
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"element_count\":1"));
}
