//! Module: query::graph
//! Responsibility: the query-calc arena: node construction, wiring, state
//! queries, result registration, and the store change feed.
//! Does not own: walk execution (propagate), lowering (project), refresh
//! phases (refresh).
//! Boundary: the only mutation surface over query-calc nodes.

use std::collections::{BTreeMap, BTreeSet};

use crate::store::{ElementId, PathId, SourceIndexer};

use super::{
    IntersectionNode, NodeId, ProjId, QueryNode, ResultId, TerminalNode, ValuePredicate,
};

///
/// DeltaKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeltaKind {
    Add,
    Remove,
}

///
/// ResultDelta
///
/// One outward notification: elements entering or leaving a result's match
/// or projection stream. Drained by the engine and fed to consumers in
/// emission order.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResultDelta {
    pub result: ResultId,
    pub proj: ProjId,
    pub kind: DeltaKind,
    pub elements: Vec<ElementId>,
}

///
/// ResultState
///

#[derive(Clone, Copy, Debug)]
pub(crate) struct ResultState {
    pub(crate) root: NodeId,
}

///
/// QueryGraph
///
/// Arena of query-calculation nodes with explicit parent back-pointers.
/// All node operations go through graph methods taking node ids, so the
/// node tree never holds references into itself.
///

#[derive(Debug, Default)]
pub struct QueryGraph {
    pub(crate) nodes: Vec<Option<QueryNode>>,
    pub(crate) results: BTreeMap<ResultId, ResultState>,
    pub(crate) deltas: Vec<ResultDelta>,
    pub(crate) active_paths: BTreeSet<PathId>,
    next_result: u32,
}

impl QueryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- construction ----

    pub fn add_terminal(
        &mut self,
        path: PathId,
        predicate: ValuePredicate,
        is_projection: bool,
    ) -> NodeId {
        self.push(QueryNode::Terminal(TerminalNode::new(
            path,
            predicate,
            is_projection,
        )))
    }

    pub fn add_intersection(&mut self) -> NodeId {
        self.push(QueryNode::Intersection(IntersectionNode::new()))
    }

    /// Wire `child` under `parent`. Takes effect at the next refresh of the
    /// query the parent belongs to.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(child).set_parent(Some(parent));
        self.intersection_mut(parent).pending_subs.push(child);
    }

    /// Queue `child` for removal from `parent` at the next refresh. For
    /// immediate removal see `update_query_after_node_removal`.
    pub fn detach(&mut self, parent: NodeId, child: NodeId) {
        self.intersection_mut(parent).pending_removals.push(child);
    }

    /// Register a consumer on a root node.
    pub fn register_result(&mut self, root: NodeId) -> ResultId {
        assert!(
            self.node(root).parent().is_none(),
            "results register on root nodes only: {root}"
        );

        let id = ResultId(self.next_result);
        self.next_result += 1;
        self.results.insert(id, ResultState { root });

        id
    }

    pub fn drop_result(&mut self, result: ResultId) {
        if let Some(state) = self.results.remove(&result)
            && matches!(self.node(state.root), QueryNode::Intersection(_))
        {
            self.intersection_mut(state.root).proj_matches.remove(&result);
        }
    }

    /// Projection sites reachable from a result's root: `(proj id, path)`
    /// per projection terminal, depth first.
    #[must_use]
    pub fn projection_sites(&self, result: ResultId) -> Vec<(ProjId, PathId)> {
        let Some(state) = self.results.get(&result) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        self.collect_projection_sites(state.root, &mut out);
        out
    }

    fn collect_projection_sites(&self, node: NodeId, out: &mut Vec<(ProjId, PathId)>) {
        match self.node(node) {
            QueryNode::Terminal(terminal) => {
                if terminal.is_projection {
                    out.push((ProjId(node.0), terminal.path));
                }
            }
            QueryNode::Intersection(intersection) => {
                for sub in intersection.projection_subs.clone() {
                    self.collect_projection_sites(sub, out);
                }
            }
        }
    }

    // ---- arena access ----

    fn push(&mut self, node: QueryNode) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(Some(node));
        id
    }

    pub(crate) fn node(&self, id: NodeId) -> &QueryNode {
        self.nodes
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("query node vacated: {id}"))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut QueryNode {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("query node vacated: {id}"))
    }

    pub(crate) fn intersection(&self, id: NodeId) -> &IntersectionNode {
        match self.node(id) {
            QueryNode::Intersection(node) => node,
            QueryNode::Terminal(_) => panic!("expected intersection node: {id}"),
        }
    }

    pub(crate) fn intersection_mut(&mut self, id: NodeId) -> &mut IntersectionNode {
        match self.node_mut(id) {
            QueryNode::Intersection(node) => node,
            QueryNode::Terminal(_) => panic!("expected intersection node: {id}"),
        }
    }

    pub(crate) fn terminal(&self, id: NodeId) -> &TerminalNode {
        match self.node(id) {
            QueryNode::Terminal(node) => node,
            QueryNode::Intersection(_) => panic!("expected terminal node: {id}"),
        }
    }

    pub(crate) fn terminal_mut(&mut self, id: NodeId) -> &mut TerminalNode {
        match self.node_mut(id) {
            QueryNode::Terminal(node) => node,
            QueryNode::Intersection(_) => panic!("expected terminal node: {id}"),
        }
    }

    /// Drop an arena slot after the node has been unlinked everywhere.
    pub(crate) fn vacate(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    // ---- state queries ----

    #[must_use]
    pub fn is_projection(&self, node: NodeId) -> bool {
        self.node(node).is_projection()
    }

    /// A projection node whose matches also count toward its parent.
    #[must_use]
    pub fn is_selection_projection(&self, node: NodeId) -> bool {
        self.node(node).is_projection()
            && self
                .node(node)
                .parent()
                .is_some_and(|parent| self.sub_counts_toward(parent, node))
    }

    /// The projection node that feeds result consumers directly.
    #[must_use]
    pub fn is_generating_projection(&self, node: NodeId) -> bool {
        self.node(node).is_projection() && self.node(node).parent().is_none()
    }

    #[must_use]
    pub fn sub_proj_must_add_matches(&self, node: NodeId) -> bool {
        self.intersection(node).sub_proj_must_add_matches()
    }

    #[must_use]
    pub fn adds_proj_matches_to_sub_nodes(&self, node: NodeId) -> bool {
        self.intersection(node).needs_lowering
    }

    /// Match-point count of a path on an intersection node.
    #[must_use]
    pub fn match_point_count(&self, node: NodeId, path: PathId) -> u32 {
        self.intersection(node).match_points.count(path)
    }

    /// Projection-match-point count of a path on an intersection node.
    #[must_use]
    pub fn proj_match_point_count(&self, node: NodeId, path: PathId) -> u32 {
        self.intersection(node).proj_match_points.count(path)
    }

    /// Whether a sub-node's matches count toward the node's full match
    /// count.
    pub(crate) fn sub_counts_toward(&self, node: NodeId, sub: NodeId) -> bool {
        let intersection = self.intersection(node);
        if intersection.projection_subs.contains(&sub) {
            intersection.proj_subs_add_matches
        } else {
            true
        }
    }

    // ---- match access ----

    pub(crate) fn element_path(store: &dyn SourceIndexer, id: ElementId) -> Option<PathId> {
        store.entry(id).map(|entry| entry.path_id)
    }

    /// Full matches of a node, ascending by id.
    #[must_use]
    pub fn matches_vec(&self, node: NodeId, store: &dyn SourceIndexer) -> Vec<ElementId> {
        self.matches_set(node, store).into_iter().collect()
    }

    /// Full matches of a node as a set.
    #[must_use]
    pub fn matches_set(&self, node: NodeId, store: &dyn SourceIndexer) -> BTreeSet<ElementId> {
        match self.node(node) {
            QueryNode::Terminal(terminal) => terminal.matches.clone(),
            QueryNode::Intersection(intersection) => {
                intersection.full_matches(|id| Self::element_path(store, id))
            }
        }
    }

    /// Full matches raised through dominating elements to the root path.
    #[must_use]
    pub fn fully_raised_matches(&self, node: NodeId, store: &dyn SourceIndexer) -> Vec<ElementId> {
        let mut out: Vec<ElementId> = Vec::new();

        for id in self.matches_set(node, store) {
            let mut current = id;
            loop {
                let Some(entry) = store.entry(current) else {
                    break;
                };
                if entry.path_id.is_root() {
                    break;
                }
                let Some(parent) = entry.parent_id else {
                    break;
                };
                current = parent;
            }
            if !out.contains(&current) {
                out.push(current);
            }
        }

        out
    }

    /// Filter `ids` down to full matches of the node.
    #[must_use]
    pub fn filter_matches(
        &self,
        node: NodeId,
        ids: &[ElementId],
        store: &dyn SourceIndexer,
    ) -> Vec<ElementId> {
        let matches = self.matches_set(node, store);
        ids.iter().copied().filter(|id| matches.contains(id)).collect()
    }

    /// Projection matches of a result at this node.
    #[must_use]
    pub fn proj_matches(&self, node: NodeId, result: ResultId) -> Vec<ElementId> {
        match self.node(node) {
            QueryNode::Intersection(intersection) => intersection
                .proj_matches
                .get(&result)
                .map(|table| {
                    let mut ids: Vec<ElementId> = table.keys().copied().collect();
                    ids.sort_unstable();
                    ids
                })
                .unwrap_or_default(),
            QueryNode::Terminal(_) => Vec::new(),
        }
    }

    /// Filter `ids` down to projection matches of a result.
    #[must_use]
    pub fn filter_proj_matches(
        &self,
        node: NodeId,
        ids: &[ElementId],
        result: ResultId,
    ) -> Vec<ElementId> {
        match self.node(node) {
            QueryNode::Intersection(intersection) => intersection
                .proj_matches
                .get(&result)
                .map(|table| {
                    ids.iter()
                        .copied()
                        .filter(|id| table.contains_key(id))
                        .collect()
                })
                .unwrap_or_default(),
            QueryNode::Terminal(_) => Vec::new(),
        }
    }

    // ---- outward deltas ----

    pub(crate) fn push_delta(
        &mut self,
        result: ResultId,
        proj: ProjId,
        kind: DeltaKind,
        elements: Vec<ElementId>,
    ) {
        if elements.is_empty() {
            return;
        }
        self.deltas.push(ResultDelta {
            result,
            proj,
            kind,
            elements,
        });
    }

    /// Drain accumulated result notifications, in emission order.
    pub fn take_deltas(&mut self) -> Vec<ResultDelta> {
        std::mem::take(&mut self.deltas)
    }

    /// The root node a result is registered on.
    #[must_use]
    pub fn result_root(&self, result: ResultId) -> Option<NodeId> {
        self.results.get(&result).map(|state| state.root)
    }

    pub(crate) fn results_on(&self, node: NodeId) -> Vec<ResultId> {
        self.results
            .iter()
            .filter(|(_, state)| state.root == node)
            .map(|(id, _)| *id)
            .collect()
    }

    // ---- store change feed ----

    /// Feed store changes into the graph. `removed` pairs must be applied
    /// while the store still resolves their entries (stage with
    /// `TreeStore::subtree` before destroying).
    pub fn apply_store_delta(
        &mut self,
        store: &dyn SourceIndexer,
        added: &[(PathId, ElementId)],
        removed: &[(PathId, ElementId)],
    ) {
        // removals first: a replacement add for the same element id must
        // land after the old state is gone
        if !removed.is_empty() {
            self.route_removals(store, removed);
        }
        if !added.is_empty() {
            self.route_additions(store, added);
        }
    }

    fn route_additions(&mut self, store: &dyn SourceIndexer, added: &[(PathId, ElementId)]) {
        let newly_active: Vec<PathId> = added
            .iter()
            .map(|(path, _)| *path)
            .filter(|path| !self.active_paths.contains(path))
            .collect();
        for path in &newly_active {
            self.active_paths.insert(*path);
        }
        for path in newly_active {
            self.path_activation_changed(path, store);
        }

        for node_id in self.terminal_ids() {
            let terminal = self.terminal(node_id);
            let path = terminal.path;

            let ids: Vec<ElementId> = added
                .iter()
                .filter(|(p, id)| *p == path && terminal.predicate.matches(store, *id))
                .map(|(_, id)| *id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            let fresh: Vec<ElementId> = {
                let terminal = self.terminal_mut(node_id);
                ids.into_iter()
                    .filter(|id| terminal.matches.insert(*id))
                    .collect()
            };
            if fresh.is_empty() {
                continue;
            }

            self.terminal_matches_changed(node_id, &fresh, DeltaKind::Add, store);
        }
    }

    fn route_removals(&mut self, store: &dyn SourceIndexer, removed: &[(PathId, ElementId)]) {
        for node_id in self.terminal_ids() {
            let terminal = self.terminal(node_id);
            let path = terminal.path;

            let ids: Vec<ElementId> = removed
                .iter()
                .filter(|(p, _)| *p == path)
                .map(|(_, id)| *id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            let gone: Vec<ElementId> = {
                let terminal = self.terminal_mut(node_id);
                ids.into_iter()
                    .filter(|id| terminal.matches.remove(id))
                    .collect()
            };
            if gone.is_empty() {
                continue;
            }

            self.terminal_matches_changed(node_id, &gone, DeltaKind::Remove, store);
        }

        let maybe_inactive: BTreeSet<PathId> = removed.iter().map(|(path, _)| *path).collect();
        for path in maybe_inactive {
            if self.active_paths.contains(&path) && !store.path_has_elements(path) {
                self.active_paths.remove(&path);
                self.path_activation_changed(path, store);
            }
        }
    }

    pub(crate) fn terminal_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Some(QueryNode::Terminal(_)) => Some(NodeId(u32::try_from(index).unwrap_or(0))),
                _ => None,
            })
            .collect()
    }

    /// Re-check carrying-data status for a set of paths after the store has
    /// been mutated (removal notifications run before destruction, so
    /// deactivation is only observable afterwards).
    pub fn reconcile_path_activity(
        &mut self,
        store: &dyn SourceIndexer,
        paths: impl IntoIterator<Item = PathId>,
    ) {
        for path in paths {
            if self.active_paths.contains(&path) && !store.path_has_elements(path) {
                self.active_paths.remove(&path);
                self.path_activation_changed(path, store);
            }
        }
    }

    /// A path flipped between carrying and not carrying data: re-register
    /// terminal match points whose prefix chains include it.
    fn path_activation_changed(&mut self, path: PathId, store: &dyn SourceIndexer) {
        for node_id in self.terminal_ids() {
            let terminal = self.terminal(node_id);
            if terminal.parent.is_none() {
                continue;
            }
            if !store
                .prefix_chain(terminal.path)
                .contains(&path)
            {
                continue;
            }

            self.refresh_terminal_match_points(node_id, store);
        }
    }
}
