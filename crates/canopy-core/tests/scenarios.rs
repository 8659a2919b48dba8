//! End-to-end scenarios over the query and merge cores.

mod common;

use std::{cell::RefCell, rc::Rc};

use canopy_core::{
    merge::{MappingSpec, MergeIndexer, Priority},
    query::{DeltaKind, ProjId, QueryGraph, ResultId, ValuePredicate},
    store::{
        ElementId, Identity, NodeEntry, NodeKind, NodeValue, OperatorKind, SourceIndexer,
        TreeStore,
    },
};

fn attributes() -> NodeEntry {
    NodeEntry::attributes()
}

fn int(value: i64) -> NodeEntry {
    NodeEntry::terminal(NodeValue::Int(value))
}

/// Scenario: two-path intersection with raising.
///
/// Two rows `{a: {b, c}}` where no single `a` satisfies both conditions;
/// completing one row afterwards produces exactly that row's `a` node.
#[test]
fn two_path_intersection_with_raising() {
    let alloc = common::alloc();
    let mut store = common::store(&alloc, 0);

    let r0 = store.insert_at(None, &[], attributes()).unwrap();
    let a0 = store.insert_at(Some(r0), &["a"], attributes()).unwrap();
    store.insert_at(Some(a0), &["b"], int(1)).unwrap();
    let c0 = store.insert_at(Some(a0), &["c"], int(2)).unwrap();

    let r1 = store.insert_at(None, &[], attributes()).unwrap();
    let a1 = store.insert_at(Some(r1), &["a"], attributes()).unwrap();
    store.insert_at(Some(a1), &["b"], int(2)).unwrap();
    store.insert_at(Some(a1), &["c"], int(1)).unwrap();

    let path_ab = common::path(&alloc, &["a", "b"]);
    let path_ac = common::path(&alloc, &["a", "c"]);

    let mut graph = QueryGraph::new();
    let root = graph.add_intersection();
    let t_b = graph.add_terminal(path_ab, ValuePredicate::Eq(NodeValue::Int(1)), false);
    let t_c = graph.add_terminal(path_ac, ValuePredicate::Eq(NodeValue::Int(1)), false);
    graph.attach(root, t_b);
    graph.attach(root, t_c);
    graph.refresh_query(root, &store).unwrap();

    // a0 satisfies only `b`, a1 only `c`: no intersection match
    assert!(graph.matches_vec(root, &store).is_empty());

    // complete row 0: replace `c: 2` with `c: 1`
    let doomed = store.subtree(c0);
    graph.apply_store_delta(&store, &[], &doomed);
    store.remove_element(c0).unwrap();

    let c_new = store.insert_at(Some(a0), &["c"], int(1)).unwrap();
    graph.apply_store_delta(&store, &[(path_ac, c_new)], &[]);

    assert_eq!(graph.matches_vec(root, &store), vec![a0]);
    assert_eq!(graph.fully_raised_matches(root, &store), vec![r0]);
    assert_eq!(graph.filter_matches(root, &[a0, a1], &store), vec![a0]);
}

/// Scenario: projection lowering.
///
/// `{a: _, b: {c: 1, d: 1}}` projects the `a` operands of the row whose
/// selections hold.
#[test]
fn projection_lowering() {
    let alloc = common::alloc();
    let mut store = common::store(&alloc, 0);

    let r0 = store.insert_at(None, &[], attributes()).unwrap();
    let a0_1 = store.insert_at(Some(r0), &["a"], int(1)).unwrap();
    let a0_2 = store.insert_at(Some(r0), &["a"], int(2)).unwrap();
    let b0 = store.insert_at(Some(r0), &["b"], attributes()).unwrap();
    store.insert_at(Some(b0), &["c"], int(1)).unwrap();
    store.insert_at(Some(b0), &["d"], int(1)).unwrap();

    let r1 = store.insert_at(None, &[], attributes()).unwrap();
    store.insert_at(Some(r1), &["a"], int(3)).unwrap();
    store.insert_at(Some(r1), &["a"], int(4)).unwrap();
    let b1 = store.insert_at(Some(r1), &["b"], attributes()).unwrap();
    store.insert_at(Some(b1), &["c"], int(2)).unwrap();
    store.insert_at(Some(b1), &["d"], int(2)).unwrap();

    let path_a = common::path(&alloc, &["a"]);
    let path_bc = common::path(&alloc, &["b", "c"]);
    let path_bd = common::path(&alloc, &["b", "d"]);

    let mut graph = QueryGraph::new();
    let root = graph.add_intersection();
    let t_proj = graph.add_terminal(path_a, ValuePredicate::Any, true);
    let t_c = graph.add_terminal(path_bc, ValuePredicate::Eq(NodeValue::Int(1)), false);
    let t_d = graph.add_terminal(path_bd, ValuePredicate::Eq(NodeValue::Int(1)), false);
    graph.attach(root, t_proj);
    graph.attach(root, t_c);
    graph.attach(root, t_d);
    graph.refresh_query(root, &store).unwrap();

    let result = graph.register_result(root);
    assert!(graph.is_projection(root));
    assert!(!graph.sub_proj_must_add_matches(root));

    let fulls = graph.matches_vec(root, &store);
    graph.add_proj_matches(root, &fulls, result, &store);

    let projected = graph.proj_matches(root, result);
    assert_eq!(projected, vec![a0_1, a0_2]);

    let sites = graph.projection_sites(result);
    assert_eq!(sites, vec![(ProjId(t_proj.0), path_a)]);
}

/// Scenario: priority merge. The higher-priority mapping wins the slot;
/// removing its node promotes the shelved one back in.
#[test]
fn priority_merge_and_promotion() {
    let alloc = common::alloc();
    let source = common::shared_store(&alloc, 0);
    let target_store = common::shared_store(&alloc, 1);

    let path_s1 = common::path(&alloc, &["s1"]);
    let path_s2 = common::path(&alloc, &["s2"]);
    let path_x = common::path(&alloc, &["x"]);

    let (e1, e2) = {
        let mut store = source.borrow_mut();
        let e1 = store.insert_at(None, &["s1"], int(10)).unwrap();
        let e2 = store.insert_at(None, &["s2"], int(20)).unwrap();
        store.set_base_identity(e1, Identity::of_label("A")).unwrap();
        store.set_base_identity(e2, Identity::of_label("A")).unwrap();
        (e1, e2)
    };

    let result = ResultId(0);
    let p1 = ProjId(0);
    let p2 = ProjId(1);

    let mut merge = MergeIndexer::new(Rc::clone(&target_store));
    merge
        .add_mapping(
            result,
            p1,
            &source,
            &MappingSpec::selection(vec![(path_x, path_s1)], Priority(1)),
        )
        .unwrap();
    merge
        .add_mapping(
            result,
            p2,
            &source,
            &MappingSpec::selection(vec![(path_x, path_s2)], Priority(2)),
        )
        .unwrap();

    merge.add_proj_matches(&[e1], result, p1).unwrap();
    assert_eq!(mapped_sources_at(&target_store, path_x), vec![e1]);

    merge.add_proj_matches(&[e2], result, p2).unwrap();
    assert_eq!(mapped_sources_at(&target_store, path_x), vec![e2]);
    assert_eq!(merge.unmapped_count(), 1);

    merge.remove_proj_matches(&[e2], result, p2).unwrap();
    assert_eq!(mapped_sources_at(&target_store, path_x), vec![e1]);
    assert_eq!(merge.unmapped_count(), 0);
}

/// Scenario: operator-operand preservation. `{x: not([1, 2, 3])}` maps the
/// operator node and all three operands onto the target path.
#[test]
fn operator_operand_preservation() {
    let alloc = common::alloc();
    let source = common::shared_store(&alloc, 0);
    let target_store = common::shared_store(&alloc, 1);

    let path_x = common::path(&alloc, &["x"]);

    let (op, operands) = {
        let mut store = source.borrow_mut();
        let root = store.insert_at(None, &[], attributes()).unwrap();
        let op = store
            .insert_at(Some(root), &["x"], NodeEntry::operator(OperatorKind::Negation))
            .unwrap();
        let operands: Vec<ElementId> = (1..=3)
            .map(|value| store.insert_at(Some(op), &[], int(value)).unwrap())
            .collect();
        (op, operands)
    };

    let result = ResultId(0);
    let proj = ProjId(0);

    let mut merge = MergeIndexer::new(Rc::clone(&target_store));
    merge
        .add_mapping(
            result,
            proj,
            &source,
            &MappingSpec::selection(vec![(path_x, path_x)], Priority(1)),
        )
        .unwrap();

    // operands first: the operator must be raised and merged before them
    let mut batch = operands.clone();
    batch.push(op);
    merge.add_proj_matches(&batch, result, proj).unwrap();

    {
        let target = target_store.borrow();
        let node = target.path_node(path_x).expect("target path node");
        assert_eq!(node.nodes.len(), 4);

        let op_target = target
            .element(op)
            .map(|_| op)
            .or_else(|| {
                node.nodes
                    .keys()
                    .find(|id| {
                        target
                            .element(**id)
                            .is_some_and(|el| el.source_id == Some(op))
                    })
                    .copied()
            })
            .expect("operator mapped");

        assert_eq!(
            target.node_entry(op_target).map(|entry| entry.kind),
            Some(NodeKind::Operator(OperatorKind::Negation))
        );

        let mapped_operands = target.direct_child_elements(Some(op_target), path_x);
        assert_eq!(mapped_operands.len(), 3);
    }

    // full inverse: everything merged for the batch disappears
    merge.remove_proj_matches(&batch, result, proj).unwrap();
    assert_eq!(target_store.borrow().element_count(), 0);
}

/// Scenario: suspension round-trip. A refresh that adds a sub-query
/// suspends the node; unsuspension delivers exactly the delta.
#[test]
fn suspension_delivers_exact_delta() {
    let alloc = common::alloc();
    let mut store = common::store(&alloc, 0);

    // rows: {a: 1, b: 2}, {a: 1, b: 1}, {a: 1, b: 1}
    let mut rows = Vec::new();
    for b in [2, 1, 1] {
        let root = store.insert_at(None, &[], attributes()).unwrap();
        let a = store.insert_at(Some(root), &["a"], int(1)).unwrap();
        let b = store.insert_at(Some(root), &["b"], int(b)).unwrap();
        rows.push((root, a, b));
    }

    let path_a = common::path(&alloc, &["a"]);
    let path_b = common::path(&alloc, &["b"]);

    let mut graph = QueryGraph::new();
    let root = graph.add_intersection();
    let t_a = graph.add_terminal(path_a, ValuePredicate::Eq(NodeValue::Int(1)), false);
    graph.attach(root, t_a);
    graph.refresh_query(root, &store).unwrap();
    let result = graph.register_result(root);
    let _ = graph.take_deltas();

    // single condition: the three `a` leaves match
    let before = graph.matches_vec(root, &store);
    assert_eq!(before, vec![rows[0].1, rows[1].1, rows[2].1]);

    // adding `b == 1` narrows to rows 1 and 2, raised to their roots
    let t_b = graph.add_terminal(path_b, ValuePredicate::Eq(NodeValue::Int(1)), false);
    graph.attach(root, t_b);
    graph.refresh_query(root, &store).unwrap();

    let after = graph.matches_vec(root, &store);
    assert_eq!(after, vec![rows[1].0, rows[2].0]);

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

    assert_eq!(removes, vec![rows[0].1, rows[1].1, rows[2].1]);
    assert_eq!(adds, vec![rows[1].0, rows[2].0]);
}

/// Scenario: extension path activation. Data below the explicit mapping is
/// withheld until its target path is traced, then back-filled under the
/// already-merged nodes.
#[test]
fn extension_path_activation_backfills() {
    let alloc = common::alloc();
    let source = common::shared_store(&alloc, 0);
    let target_store = common::shared_store(&alloc, 1);

    let path_s = common::path(&alloc, &["s"]);
    let path_t = common::path(&alloc, &["t"]);
    let path_t_sub = common::path(&alloc, &["t", "sub"]);

    let (m, child) = {
        let mut store = source.borrow_mut();
        let m = store.insert_at(None, &["s"], attributes()).unwrap();
        let child = store.insert_at(Some(m), &["sub"], int(5)).unwrap();
        (m, child)
    };

    let result = ResultId(0);
    let proj = ProjId(0);

    let mut merge = MergeIndexer::new(Rc::clone(&target_store));
    merge
        .add_mapping(
            result,
            proj,
            &source,
            &MappingSpec::selection(vec![(path_t, path_s)], Priority(1)),
        )
        .unwrap();
    merge.add_proj_matches(&[m], result, proj).unwrap();

    // the explicit node merges; the untraced extension child does not
    assert_eq!(target_store.borrow().element_count(), 1);
    assert!(target_store.borrow().path_node(path_t_sub).is_none());

    merge.activate_path_tracing(path_t_sub).unwrap();

    {
        let target = target_store.borrow();
        assert_eq!(target.element_count(), 2);
        let merged = target
            .path_node(path_t_sub)
            .map(|node| node.nodes.len())
            .unwrap_or_default();
        assert_eq!(merged, 1);
        let mapped_child = target.elements_at_path(path_t_sub)[0];
        assert_eq!(
            target.element(mapped_child).and_then(|el| el.source_id),
            Some(child)
        );
    }

    // activation is idempotent against already-merged children
    merge.activate_path_tracing(path_t_sub).unwrap();
    assert_eq!(target_store.borrow().element_count(), 2);

    // deactivation flushes extension nodes that are not monitored
    merge.deactivate_path_tracing(path_t_sub).unwrap();
    assert_eq!(target_store.borrow().element_count(), 1);
}

/// Mapped source ids at a target path, ascending.
fn mapped_sources_at(store: &Rc<RefCell<TreeStore>>, path: canopy_core::store::PathId) -> Vec<ElementId> {
    let store = store.borrow();
    let mut out: Vec<ElementId> = store
        .elements_at_path(path)
        .into_iter()
        .filter_map(|id| store.element(id).and_then(|el| el.source_id))
        .collect();
    out.sort_unstable();
    out
}
