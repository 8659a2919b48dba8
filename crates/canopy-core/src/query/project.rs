//! Module: query::project
//! Responsibility: projection maintenance: lowering full matches onto
//! projection sites and keeping per-result projection counts.
//! Does not own: match counting (propagate) or suspension (suspend).
//!
//! Ordering contract: membership updates (a projection terminal's matched
//! set changed) run BEFORE count walks, against the full-match set as it
//! stands at that moment. Count-driven lowering then only accounts for
//! full matches entering or leaving. Together every `(element, full)` pair
//! is counted exactly once.

use crate::{
    obs::sink::{self, MetricsEvent},
    store::{ElementId, PathId, SourceIndexer},
};

use super::{DeltaKind, NodeId, ProjId, QueryGraph, QueryNode, ResultId};

impl QueryGraph {
    /// Add projection matches for a result: `ids` are dominating matches
    /// (full matches of the node or of its parent chain) to be lowered onto
    /// the node's projection sites.
    pub fn add_proj_matches(
        &mut self,
        node: NodeId,
        ids: &[ElementId],
        result: ResultId,
        store: &dyn SourceIndexer,
    ) {
        for id in ids {
            self.lower_full(node, result, *id, DeltaKind::Add, store);
        }
    }

    /// Exact inverse of `add_proj_matches`.
    pub fn remove_proj_matches(
        &mut self,
        node: NodeId,
        ids: &[ElementId],
        result: ResultId,
        store: &dyn SourceIndexer,
    ) {
        for id in ids {
            self.lower_full(node, result, *id, DeltaKind::Remove, store);
        }
    }

    /// Lower one full match through every projection site under `node`,
    /// adjusting the per-result projection counts at the generating node.
    pub(crate) fn lower_full(
        &mut self,
        node: NodeId,
        result: ResultId,
        full: ElementId,
        kind: DeltaKind,
        store: &dyn SourceIndexer,
    ) {
        let subs: Vec<NodeId> = self.intersection(node).projection_subs.iter().copied().collect();

        for sub in subs {
            self.lower_site(node, sub, result, full, kind, store);
        }
    }

    fn lower_site(
        &mut self,
        owner: NodeId,
        site: NodeId,
        result: ResultId,
        full: ElementId,
        kind: DeltaKind,
        store: &dyn SourceIndexer,
    ) {
        match self.node(site) {
            QueryNode::Terminal(terminal) => {
                let path = terminal.path;
                let lowered: Vec<ElementId> = store
                    .dominated_nodes(path, &[full], Self::anchor_path(store, full))
                    .into_iter()
                    .filter(|id| self.terminal(site).matches.contains(id))
                    .collect();

                self.adjust_proj_counts(owner, site, result, &lowered, kind);
            }
            QueryNode::Intersection(_) => {
                // a nested projection: restrict to its own full matches
                // dominated by `full`, then recurse into its sites
                let dominated: Vec<ElementId> = self
                    .matches_set(site, store)
                    .into_iter()
                    .filter(|id| Self::is_dominated_by(store, *id, full))
                    .collect();

                for inner in dominated {
                    self.lower_full(site, result, inner, kind, store);
                }
            }
        }
    }

    /// A projection terminal's matched set changed while full matches stand:
    /// count `ids` under every full match dominating them.
    pub(crate) fn membership_proj_update(
        &mut self,
        root: NodeId,
        terminal_id: NodeId,
        result: ResultId,
        ids: &[ElementId],
        kind: DeltaKind,
        store: &dyn SourceIndexer,
    ) {
        if !matches!(self.node(root), QueryNode::Intersection(_)) {
            return;
        }
        if self.intersection(root).is_suspended() {
            return;
        }

        let fulls = self.matches_set(root, store);
        if fulls.is_empty() {
            return;
        }

        let mut counted: Vec<ElementId> = Vec::new();
        for id in ids {
            let mut current = Some(*id);
            while let Some(cursor) = current {
                if fulls.contains(&cursor) {
                    counted.push(*id);
                }
                current = store.entry(cursor).and_then(|entry| entry.parent_id);
            }
        }

        self.adjust_proj_counts(root, terminal_id, result, &counted, kind);
    }

    /// Apply one count step per `(result, element)` occurrence; emit deltas
    /// on the zero boundary.
    fn adjust_proj_counts(
        &mut self,
        owner: NodeId,
        site: NodeId,
        result: ResultId,
        elements: &[ElementId],
        kind: DeltaKind,
    ) {
        if elements.is_empty() {
            return;
        }

        let mut emitted: Vec<ElementId> = Vec::new();
        {
            let n = self.intersection_mut(owner);
            let table = n.proj_matches.entry(result).or_default();

            for id in elements {
                match kind {
                    DeltaKind::Add => {
                        let count = table.entry(*id).or_insert(0);
                        *count += 1;
                        if *count == 1 {
                            emitted.push(*id);
                        }
                    }
                    DeltaKind::Remove => {
                        let Some(count) = table.get_mut(id) else {
                            panic!("projection count missing for element: {id}");
                        };
                        assert!(*count > 0, "projection count below zero: {id}");
                        *count -= 1;
                        if *count == 0 {
                            table.remove(id);
                            emitted.push(*id);
                        }
                    }
                }
            }
        }

        if emitted.is_empty() {
            return;
        }

        sink::record(match kind {
            DeltaKind::Add => MetricsEvent::ProjMatches {
                added: emitted.len() as u64,
                removed: 0,
            },
            DeltaKind::Remove => MetricsEvent::ProjMatches {
                added: 0,
                removed: emitted.len() as u64,
            },
        });

        self.push_delta(result, ProjId(site.0), kind, emitted);
    }

    /// The current elements of one projection site (or of the root match
    /// stream), recomputed from scratch. Used to seed a freshly routed
    /// consumer.
    #[must_use]
    pub fn proj_site_matches(
        &self,
        result: ResultId,
        proj: ProjId,
        store: &dyn SourceIndexer,
    ) -> Vec<ElementId> {
        let Some(root) = self.result_root(result) else {
            return Vec::new();
        };
        if proj == ProjId::MATCHES {
            return self.matches_vec(root, store);
        }

        let site = NodeId(proj.0);
        let Some(Some(QueryNode::Terminal(terminal))) =
            self.nodes.get(site.0 as usize).map(Option::as_ref)
        else {
            return Vec::new();
        };
        let path = terminal.path;

        let mut out: std::collections::BTreeSet<ElementId> = std::collections::BTreeSet::new();
        for full in self.matches_set(root, store) {
            for id in store.dominated_nodes(path, &[full], Self::anchor_path(store, full)) {
                if self.terminal(site).matches.contains(&id) {
                    out.insert(id);
                }
            }
        }

        out.into_iter().collect()
    }

    fn anchor_path(store: &dyn SourceIndexer, id: ElementId) -> PathId {
        store
            .entry(id)
            .map_or(PathId::ROOT, |entry| entry.path_id)
    }

    pub(crate) fn is_dominated_by(
        store: &dyn SourceIndexer,
        id: ElementId,
        dominating: ElementId,
    ) -> bool {
        let mut current = Some(id);

        while let Some(cursor) = current {
            if cursor == dominating {
                return true;
            }
            current = store.entry(cursor).and_then(|entry| entry.parent_id);
        }

        false
    }
}
