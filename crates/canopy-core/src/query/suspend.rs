//! Module: query::suspend
//! Responsibility: the suspension window: snapshot full matches, strip
//! raised credits down to direct counts, replay them on unsuspension, emit
//! exactly the delta.
//! Boundary: entered only by refresh orchestration and dynamic match-point
//! registration.

use crate::{
    obs::sink::{self, MetricsEvent},
    store::{ElementId, SourceIndexer},
};

use super::{MatchMode, NodeId, QueryGraph};

impl QueryGraph {
    /// Suspend outward propagation: snapshot the full-match set, strip
    /// raised credits out of `matches` (leaving direct sub-query
    /// contributions only), and switch to count-only updates.
    ///
    /// Match-point counts may change freely while suspended; the raised
    /// structure is rebuilt from the direct counts on unsuspension.
    pub(crate) fn suspend(&mut self, node: NodeId, store: &dyn SourceIndexer) {
        if self.intersection(node).is_suspended() {
            return;
        }

        let snapshot = self
            .intersection(node)
            .full_matches(|id| Self::element_path(store, id));

        let n = self.intersection_mut(node);
        let raised = std::mem::take(&mut n.raised);
        for (parent, entries) in raised {
            let credit: u32 = entries.keys().map(|path| n.match_points.count(*path)).sum();
            if credit == 0 {
                continue;
            }

            let Some(slot) = n.matches.get_mut(&parent) else {
                panic!("raised credit without a parent count: {parent}");
            };
            assert!(*slot >= credit, "raised credit exceeds parent count: {parent}");

            *slot -= credit;
            if *slot == 0 {
                n.matches.remove(&parent);
            }
        }

        n.suspended_matches = Some(snapshot);
        n.mode = MatchMode::Suspended;

        sink::record(MetricsEvent::NodeSuspended);
    }

    /// Leave the suspension window: rebuild raising from the accumulated
    /// direct counts, diff the new full-match set against the snapshot, and
    /// propagate exactly the delta.
    pub(crate) fn unsuspend(&mut self, node: NodeId, store: &dyn SourceIndexer) {
        {
            let n = self.intersection_mut(node);
            if !n.is_suspended() {
                return;
            }

            // leave Suspended before set_mode so the replay walks run in the
            // recomputed mode
            n.mode = MatchMode::Linear;
            n.set_mode();
        }

        let direct: Vec<(ElementId, u32)> = {
            let n = self.intersection_mut(node);
            n.matches.drain().collect()
        };

        for (id, count) in direct {
            if count == 0 {
                continue;
            }
            let mut ignored = Vec::new();
            self.add_walk(node, id, count, &mut ignored, store);
        }

        let new_full = self
            .intersection(node)
            .full_matches(|id| Self::element_path(store, id));
        let old_full = self
            .intersection_mut(node)
            .suspended_matches
            .take()
            .unwrap_or_default();

        let adds: Vec<ElementId> = new_full.difference(&old_full).copied().collect();
        let removes: Vec<ElementId> = old_full.difference(&new_full).copied().collect();

        self.handle_full_delta(node, adds, removes, store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query::{DeltaKind, ValuePredicate},
        store::{NodeEntry, NodeValue, PathAllocator, PathId, TreeStore},
    };
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn suspension_round_trip_emits_exact_delta() {
        let alloc = Rc::new(RefCell::new(PathAllocator::new()));
        let mut store = TreeStore::new(crate::store::IndexerId(0), Rc::clone(&alloc));

        // three root elements, each carrying a matching leaf under "a"
        let mut roots = Vec::new();
        let mut leaves = Vec::new();
        for _ in 0..3 {
            let root = store.insert_at(None, &[], NodeEntry::attributes()).unwrap();
            let leaf = store
                .insert_at(Some(root), &["a"], NodeEntry::terminal(NodeValue::Int(1)))
                .unwrap();
            roots.push(root);
            leaves.push(leaf);
        }

        let path_a = alloc.borrow().lookup(PathId::ROOT, &["a"]).unwrap();

        let mut graph = QueryGraph::new();
        let root_node = graph.add_intersection();
        let term = graph.add_terminal(path_a, ValuePredicate::Eq(NodeValue::Int(1)), false);
        graph.attach(root_node, term);
        graph.refresh_query(root_node, &store).unwrap();
        let result = graph.register_result(root_node);
        let _ = graph.take_deltas();

        let before = graph.matches_set(root_node, &store);
        assert_eq!(before.len(), 3);

        // swap one source row for another while suspended
        graph.suspend(root_node, &store);

        let doomed = store.subtree(roots[0]);
        graph.apply_store_delta(&store, &[], &doomed);
        store.remove_element(roots[0]).unwrap();

        let new_root = store.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let new_leaf = store
            .insert_at(Some(new_root), &["a"], NodeEntry::terminal(NodeValue::Int(1)))
            .unwrap();
        graph.apply_store_delta(
            &store,
            &[(PathId::ROOT, new_root), (path_a, new_leaf)],
            &[],
        );

        graph.unsuspend(root_node, &store);

        let after = graph.matches_set(root_node, &store);
        assert!(!after.contains(&leaves[0]));
        assert!(after.contains(&new_leaf));
        assert_eq!(after.len(), 3);

        let deltas = graph.take_deltas();
        let removes: Vec<_> = deltas
            .iter()
            .filter(|delta| delta.kind == DeltaKind::Remove && delta.result == result)
            .flat_map(|delta| delta.elements.clone())
            .collect();
        let adds: Vec<_> = deltas
            .iter()
            .filter(|delta| delta.kind == DeltaKind::Add && delta.result == result)
            .flat_map(|delta| delta.elements.clone())
            .collect();

        assert_eq!(removes, vec![leaves[0]]);
        assert_eq!(adds, vec![new_leaf]);
    }
}
