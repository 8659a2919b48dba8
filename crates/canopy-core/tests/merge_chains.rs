//! Merge coverage beyond the single-pair scenarios: group chains, identity
//! groups, sub-tree monitors, and extension matches.

mod common;

use std::rc::Rc;

use canopy_core::{
    merge::{MappingSpec, MergeIndexer, Priority},
    query::{ProjId, ResultId},
    store::{
        ElementId, IdentificationId, Identity, NodeEntry, NodeValue, SourceIndexer,
    },
};

fn int(value: i64) -> NodeEntry {
    NodeEntry::terminal(NodeValue::Int(value))
}

/// A two-pair mapping vector builds a minimal and a maximal group; raw adds
/// arrive at the maximal group and reference-count the minimal level.
#[test]
fn chained_mapping_merges_both_levels() {
    let alloc = common::alloc();
    let source = common::shared_store(&alloc, 0);
    let target_store = common::shared_store(&alloc, 1);

    let path_cat = common::path(&alloc, &["cat"]);
    let path_item = common::path(&alloc, &["cat", "item"]);
    let path_out = common::path(&alloc, &["out"]);
    let path_row = common::path(&alloc, &["out", "row"]);

    let (cat, i1, i2) = {
        let mut store = source.borrow_mut();
        let cat = store.insert_at(None, &["cat"], NodeEntry::attributes()).unwrap();
        let i1 = store.insert_at(Some(cat), &["item"], int(1)).unwrap();
        let i2 = store.insert_at(Some(cat), &["item"], int(2)).unwrap();
        (cat, i1, i2)
    };

    let result = ResultId(0);
    let proj = ProjId(0);
    let mut merge = MergeIndexer::new(Rc::clone(&target_store));
    merge
        .add_mapping(
            result,
            proj,
            &source,
            &MappingSpec::selection(
                vec![(path_out, path_cat), (path_row, path_item)],
                Priority(1),
            ),
        )
        .unwrap();
    assert_eq!(merge.group_count(), 2);

    merge.add_proj_matches(&[i1, i2], result, proj).unwrap();

    {
        let target = target_store.borrow();
        let outs = target.elements_at_path(path_out);
        assert_eq!(outs.len(), 1);
        assert_eq!(
            target.element(outs[0]).and_then(|el| el.source_id),
            Some(cat)
        );

        let rows = target.direct_child_elements(Some(outs[0]), path_row);
        assert_eq!(rows.len(), 2);
    }

    // removing one item keeps the shared dominating node alive
    merge.remove_proj_matches(&[i1], result, proj).unwrap();
    assert_eq!(target_store.borrow().elements_at_path(path_out).len(), 1);
    assert_eq!(target_store.borrow().elements_at_path(path_row).len(), 1);

    // the last item releases the minimal level too
    merge.remove_proj_matches(&[i2], result, proj).unwrap();
    assert_eq!(target_store.borrow().element_count(), 0);
}

/// Identity groups collapse sources of equal identity onto one virtual
/// node; identity updates re-slot members, creating and destroying nodes.
#[test]
fn identity_group_collapses_and_reslots() {
    let alloc = common::alloc();
    let source = common::shared_store(&alloc, 0);
    let target_store = common::shared_store(&alloc, 1);

    let path_s = common::path(&alloc, &["s"]);
    let path_grp = common::path(&alloc, &["grp"]);

    let identification = IdentificationId(7);
    let x = Identity::of_label("X");
    let y = Identity::of_label("Y");
    let z = Identity::of_label("Z");

    let elements: Vec<ElementId> = {
        let mut store = source.borrow_mut();
        let ids: Vec<ElementId> = (0..3)
            .map(|value| store.insert_at(None, &["s"], int(value)).unwrap())
            .collect();
        store.set_identities(identification, &[(ids[0], x), (ids[1], x), (ids[2], y)]);
        ids
    };

    let result = ResultId(0);
    let proj = ProjId(0);
    let mut merge = MergeIndexer::new(Rc::clone(&target_store));
    let spec = MappingSpec {
        mapping: vec![(path_grp, path_s)],
        priority: Priority(1),
        source_identification: Some(identification),
        target_identification: None,
        is_identity: true,
        identity_only: true,
    };
    merge.add_mapping(result, proj, &source, &spec).unwrap();

    merge.add_proj_matches(&elements, result, proj).unwrap();

    // two identity classes -> two virtual nodes
    assert_eq!(target_store.borrow().elements_at_path(path_grp).len(), 2);

    // moving a member between classes keeps both nodes populated
    source
        .borrow_mut()
        .set_identities(identification, &[(elements[1], y)]);
    merge
        .update_source_identities(identification, &[(elements[1], y)])
        .unwrap();
    assert_eq!(target_store.borrow().elements_at_path(path_grp).len(), 2);

    // moving the last member of a class replaces its node
    source
        .borrow_mut()
        .set_identities(identification, &[(elements[0], z)]);
    merge
        .update_source_identities(identification, &[(elements[0], z)])
        .unwrap();

    let identities: Vec<Identity> = {
        let target = target_store.borrow();
        let mut out: Vec<Identity> = target
            .elements_at_path(path_grp)
            .into_iter()
            .filter_map(|id| target.element(id).map(|el| el.identity))
            .collect();
        out.sort_unstable();
        out
    };
    let mut expected = vec![y, z];
    expected.sort_unstable();
    assert_eq!(identities, expected);
}

/// A consumer sub-tree monitor pulls the full source sub-tree regardless of
/// tracing; releasing it flushes what tracing does not keep.
#[test]
fn subtree_monitor_pulls_and_flushes() {
    let alloc = common::alloc();
    let source = common::shared_store(&alloc, 0);
    let target_store = common::shared_store(&alloc, 1);

    let path_s = common::path(&alloc, &["s"]);
    let path_t = common::path(&alloc, &["t"]);

    let m = {
        let mut store = source.borrow_mut();
        let m = store.insert_at(None, &["s"], NodeEntry::attributes()).unwrap();
        let mid = store.insert_at(Some(m), &["sub"], NodeEntry::attributes()).unwrap();
        store.insert_at(Some(mid), &["leaf"], int(9)).unwrap();
        m
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
    assert_eq!(target_store.borrow().element_count(), 1);

    let m_target = target_store.borrow().elements_at_path(path_t)[0];
    merge.register_subtree_monitor(m_target).unwrap();
    assert_eq!(target_store.borrow().element_count(), 3);

    merge.release_subtree_monitor(m_target).unwrap();
    assert_eq!(target_store.borrow().element_count(), 1);
}

/// Extension matches merge under their nearest mapped dominating node and
/// withdraw individually.
#[test]
fn extension_matches_merge_under_mapped_ancestors() {
    let alloc = common::alloc();
    let source = common::shared_store(&alloc, 0);
    let target_store = common::shared_store(&alloc, 1);

    let path_s = common::path(&alloc, &["s"]);
    let path_t = common::path(&alloc, &["t"]);
    let path_t_sub = common::path(&alloc, &["t", "sub"]);

    let m = {
        let mut store = source.borrow_mut();
        store.insert_at(None, &["s"], NodeEntry::attributes()).unwrap()
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

    // dependent data arrives later, via a mapping monitor on the source
    let child = {
        let mut store = source.borrow_mut();
        store.insert_at(Some(m), &["sub"], int(4)).unwrap()
    };
    merge.add_extension_matches(&[child], result, proj).unwrap();

    {
        let target = target_store.borrow();
        assert_eq!(target.elements_at_path(path_t_sub).len(), 1);
        let mapped = target.elements_at_path(path_t_sub)[0];
        assert_eq!(target.element(mapped).and_then(|el| el.source_id), Some(child));
    }

    merge.remove_extension_matches(&[child], result, proj).unwrap();
    assert!(target_store.borrow().elements_at_path(path_t_sub).is_empty());
    assert_eq!(target_store.borrow().element_count(), 1);
}
