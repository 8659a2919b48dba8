//! Query-calc operations beyond the core scenarios: standalone sub-node
//! removal, dynamic match-point registration, and state queries.

mod common;

use canopy_core::{
    query::{DeltaKind, QueryGraph, ValuePredicate},
    store::{ElementId, NodeEntry, NodeValue, PathId},
};

fn int(value: i64) -> NodeEntry {
    NodeEntry::terminal(NodeValue::Int(value))
}

/// Removing a sub-query outside the refresh cycle widens the match set and
/// delivers the exact delta.
#[test]
fn node_removal_unwinds_sub_query_state() {
    let alloc = common::alloc();
    let mut store = common::store(&alloc, 0);

    let mut rows = Vec::new();
    for b in [2, 1, 1] {
        let root = store.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let a = store.insert_at(Some(root), &["a"], int(1)).unwrap();
        store.insert_at(Some(root), &["b"], int(b)).unwrap();
        rows.push((root, a));
    }

    let path_a = common::path(&alloc, &["a"]);
    let path_b = common::path(&alloc, &["b"]);

    let mut graph = QueryGraph::new();
    let root = graph.add_intersection();
    let t_a = graph.add_terminal(path_a, ValuePredicate::Eq(NodeValue::Int(1)), false);
    let t_b = graph.add_terminal(path_b, ValuePredicate::Eq(NodeValue::Int(1)), false);
    graph.attach(root, t_a);
    graph.attach(root, t_b);
    graph.refresh_query(root, &store).unwrap();
    let result = graph.register_result(root);
    let _ = graph.take_deltas();

    assert_eq!(
        graph.matches_vec(root, &store),
        vec![rows[1].0, rows[2].0]
    );
    assert_eq!(graph.match_point_count(root, PathId::ROOT), 2);

    graph.update_query_after_node_removal(root, t_b, &store).unwrap();

    // back to the single-condition matches: every matching `a` leaf
    assert_eq!(
        graph.matches_vec(root, &store),
        vec![rows[0].1, rows[1].1, rows[2].1]
    );
    assert_eq!(graph.match_point_count(root, PathId::ROOT), 1);
    assert_eq!(graph.match_point_count(root, path_b), 0);

    let deltas = graph.take_deltas();
    let removes: Vec<ElementId> = deltas
        .iter()
        .filter(|d| d.result == result && d.kind == DeltaKind::Remove)
        .flat_map(|d| d.elements.clone())
        .collect();
    let adds: Vec<ElementId> = deltas
        .iter()
        .filter(|d| d.result == result && d.kind == DeltaKind::Add)
        .flat_map(|d| d.elements.clone())
        .collect();

    assert_eq!(removes, vec![rows[1].0, rows[2].0]);
    assert_eq!(adds, vec![rows[0].1, rows[1].1, rows[2].1]);
}

/// A detach queued for the next refresh unwinds through the three phases
/// and ends in the same state as the standalone removal.
#[test]
fn refresh_applies_queued_detach() {
    let alloc = common::alloc();
    let mut store = common::store(&alloc, 0);

    let mut rows = Vec::new();
    for b in [2, 1, 1] {
        let root = store.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let a = store.insert_at(Some(root), &["a"], int(1)).unwrap();
        store.insert_at(Some(root), &["b"], int(b)).unwrap();
        rows.push((root, a));
    }

    let path_a = common::path(&alloc, &["a"]);
    let path_b = common::path(&alloc, &["b"]);

    let mut graph = QueryGraph::new();
    let root = graph.add_intersection();
    let t_a = graph.add_terminal(path_a, ValuePredicate::Eq(NodeValue::Int(1)), false);
    let t_b = graph.add_terminal(path_b, ValuePredicate::Eq(NodeValue::Int(1)), false);
    graph.attach(root, t_a);
    graph.attach(root, t_b);
    graph.refresh_query(root, &store).unwrap();
    assert_eq!(graph.matches_vec(root, &store).len(), 2);

    graph.detach(root, t_b);
    graph.refresh_query(root, &store).unwrap();

    assert_eq!(
        graph.matches_vec(root, &store),
        vec![rows[0].1, rows[1].1, rows[2].1]
    );
    assert_eq!(graph.match_point_count(root, path_b), 0);
}

/// Dynamic match-point registration re-selects the node's mode inside a
/// suspension window and is exactly reversible.
#[test]
fn match_point_registration_round_trips() {
    let alloc = common::alloc();
    let mut store = common::store(&alloc, 0);

    let root_el = store.insert_at(None, &[], NodeEntry::attributes()).unwrap();
    store.insert_at(Some(root_el), &["a"], int(1)).unwrap();

    let path_a = common::path(&alloc, &["a"]);
    let path_c = common::path(&alloc, &["c"]);

    let mut graph = QueryGraph::new();
    let root = graph.add_intersection();
    let t_a = graph.add_terminal(path_a, ValuePredicate::Eq(NodeValue::Int(1)), false);
    graph.attach(root, t_a);
    graph.refresh_query(root, &store).unwrap();

    let before = graph.matches_vec(root, &store);
    assert_eq!(before.len(), 1);
    assert_eq!(graph.match_point_count(root, path_c), 0);

    graph.add_to_match_points(root, path_c, t_a, &store);
    assert_eq!(graph.match_point_count(root, path_c), 1);
    // the registration is table-only until data accumulates there
    assert_eq!(graph.matches_vec(root, &store), before);

    graph.remove_from_match_points(root, path_c, t_a, &store);
    assert_eq!(graph.match_point_count(root, path_c), 0);
    assert_eq!(graph.matches_vec(root, &store), before);
}

/// State queries over projection wiring.
#[test]
fn projection_state_queries() {
    let alloc = common::alloc();
    let mut store = common::store(&alloc, 0);

    let root_el = store.insert_at(None, &[], NodeEntry::attributes()).unwrap();
    store.insert_at(Some(root_el), &["a"], int(1)).unwrap();
    store.insert_at(Some(root_el), &["b"], int(2)).unwrap();

    let path_a = common::path(&alloc, &["a"]);
    let path_b = common::path(&alloc, &["b"]);

    let mut graph = QueryGraph::new();
    let root = graph.add_intersection();
    let t_a = graph.add_terminal(path_a, ValuePredicate::Any, true);
    let t_b = graph.add_terminal(path_b, ValuePredicate::Any, true);
    graph.attach(root, t_a);
    graph.attach(root, t_b);
    graph.refresh_query(root, &store).unwrap();

    // two projections: both must add their matches
    assert!(graph.is_projection(root));
    assert!(graph.is_generating_projection(root));
    assert!(graph.sub_proj_must_add_matches(root));
    assert!(graph.proj_match_point_count(root, PathId::ROOT) >= 1);

    // with both projections adding, the row satisfying both is the match,
    // raised to the root element
    assert_eq!(graph.matches_vec(root, &store), vec![root_el]);
}
