//! Module: query::propagate
//! Responsibility: match addition and removal walks: counting, raising
//! through dominating elements, full-match detection, and outward dispatch.
//! Does not own: projection lowering (project) or suspension (suspend).
//! Boundary: the only writers of `matches` and `raised`.

use crate::{
    obs::sink::{self, ExecKind, MetricsEvent, Span},
    store::{ElementId, SourceIndexer},
};

use super::{
    DeltaKind, MatchMode, NodeId, ProjId, QueryGraph, RaisedEntry,
};

impl QueryGraph {
    /// Add matches arriving from one of the node's own sub-nodes. Each
    /// element contributes one sub-query count; crossing a match-point
    /// count either completes a full match or raises to the dominating
    /// element.
    pub fn add_matches(
        &mut self,
        node: NodeId,
        source: NodeId,
        ids: &[ElementId],
        store: &dyn SourceIndexer,
    ) {
        debug_assert!(
            self.intersection(node).sub_nodes.contains(&source)
                || self.intersection(node).pending_subs.contains(&source),
            "add_matches from a non-sub node: {source}"
        );

        let mut span = Span::new(ExecKind::MatchAdd);
        span.set_elements(ids.len() as u64);

        match self.intersection(node).mode {
            MatchMode::Suspended => {
                let n = self.intersection_mut(node);
                for id in ids {
                    *n.matches.entry(*id).or_insert(0) += 1;
                }
            }
            MatchMode::Linear => {
                let full_adds = self.add_linear(node, ids);
                self.handle_full_delta(node, full_adds, Vec::new(), store);
            }
            MatchMode::Raising => {
                let mut full_adds = Vec::new();
                for id in ids {
                    self.add_walk(node, *id, 1, &mut full_adds, store);
                }
                self.handle_full_delta(node, full_adds, Vec::new(), store);
            }
        }
    }

    /// Exact inverse of `add_matches`. Tolerates a transient count above the
    /// match-point count (replacement add preceding a remove).
    pub fn remove_matches(
        &mut self,
        node: NodeId,
        source: NodeId,
        ids: &[ElementId],
        store: &dyn SourceIndexer,
    ) {
        // removal may arrive for a sub already unlinked (refresh phase 3 and
        // node-removal unwind both use the sub's pre-removal state)
        debug_assert!(source != node, "remove_matches source is the node itself");

        let mut span = Span::new(ExecKind::MatchRemove);
        span.set_elements(ids.len() as u64);

        match self.intersection(node).mode {
            MatchMode::Suspended => {
                let n = self.intersection_mut(node);
                for id in ids {
                    let Some(count) = n.matches.get_mut(id) else {
                        panic!("removing match with no count: {id}");
                    };
                    assert!(*count > 0, "match count below zero: {id}");
                    *count -= 1;
                    if *count == 0 {
                        n.matches.remove(id);
                    }
                }
            }
            MatchMode::Linear => {
                let full_removes = self.remove_linear(node, ids);
                self.handle_full_delta(node, Vec::new(), full_removes, store);
            }
            MatchMode::Raising => {
                let mut full_removes = Vec::new();
                for id in ids {
                    self.remove_walk(node, *id, &mut full_removes, store);
                }
                self.handle_full_delta(node, Vec::new(), full_removes, store);
            }
        }
    }

    /// Linear add: every match point is maximal, so a count reaching the
    /// full match count is a full match without consulting the store.
    fn add_linear(&mut self, node: NodeId, ids: &[ElementId]) -> Vec<ElementId> {
        let n = self.intersection_mut(node);
        let full = n.full_match_count();
        let mut full_adds = Vec::new();

        for id in ids {
            let count = n.matches.entry(*id).or_insert(0);
            *count += 1;
            if *count == full {
                full_adds.push(*id);
            }
        }

        full_adds
    }

    fn remove_linear(&mut self, node: NodeId, ids: &[ElementId]) -> Vec<ElementId> {
        let n = self.intersection_mut(node);
        let full = n.full_match_count();
        let mut full_removes = Vec::new();

        for id in ids {
            let Some(count) = n.matches.get_mut(id) else {
                panic!("removing match with no count: {id}");
            };
            assert!(*count > 0, "match count below zero: {id}");

            if *count == full {
                full_removes.push(*id);
            }
            *count -= 1;
            if *count == 0 {
                n.matches.remove(id);
            }
        }

        full_removes
    }

    /// Raising walk for one element. `incr` is the carry-in: one for a
    /// direct sub-query match, the satisfied match-point count for a raise
    /// step, an accumulated direct count during post-suspension replay.
    pub(crate) fn add_walk(
        &mut self,
        node: NodeId,
        start: ElementId,
        start_incr: u32,
        full_adds: &mut Vec<ElementId>,
        store: &dyn SourceIndexer,
    ) {
        let mut id = start;
        let mut incr = start_incr;
        let mut raised_steps = 0u64;

        loop {
            let Some(path) = Self::element_path(store, id) else {
                break;
            };
            let parent = store.entry(id).and_then(|entry| entry.parent_id);

            let n = self.intersection_mut(node);
            let count = {
                let slot = n.matches.entry(id).or_insert(0);
                *slot += incr;
                *slot
            };

            let point = n.match_points.count(path);
            if point == 0 || count != point {
                // below the match point, or transiently above it
                break;
            }

            if point == n.full_match_count() && n.counts_as_full(path) {
                full_adds.push(id);
                break;
            }

            // raise to the dominating element
            let Some(parent) = parent else {
                break;
            };
            let track_children = n.proj_match_points.contains(path);
            let entry = n
                .raised
                .entry(parent)
                .or_default()
                .entry(path)
                .or_insert_with(|| RaisedEntry::new(track_children));
            let had = entry.contributors() > 0;
            entry.add_contributor(id);
            if had {
                // the match point already contributed to the parent
                break;
            }

            raised_steps += 1;
            incr = point;
            id = parent;
        }

        if raised_steps > 0 {
            sink::record(MetricsEvent::MatchesRaised {
                count: raised_steps,
            });
        }
    }

    fn remove_walk(
        &mut self,
        node: NodeId,
        start: ElementId,
        full_removes: &mut Vec<ElementId>,
        store: &dyn SourceIndexer,
    ) {
        let mut id = start;
        let mut decr = 1u32;

        loop {
            let Some(path) = Self::element_path(store, id) else {
                break;
            };
            let parent = store.entry(id).and_then(|entry| entry.parent_id);

            let n = self.intersection_mut(node);
            let Some(slot) = n.matches.get_mut(&id) else {
                panic!("removing match with no count: {id}");
            };
            let old = *slot;
            assert!(old >= decr, "match count below zero: {id}");

            *slot = old - decr;
            if *slot == 0 {
                n.matches.remove(&id);
            }

            let point = n.match_points.count(path);
            if old < point || point == 0 {
                break;
            }
            if old > point {
                // transient anomaly: replacement add preceded this remove
                break;
            }

            // old == point: the element loses its satisfied status here
            if point == n.full_match_count() && n.counts_as_full(path) {
                full_removes.push(id);
                break;
            }

            let Some(parent) = parent else {
                break;
            };
            let Some(per_parent) = n.raised.get_mut(&parent) else {
                panic!("raised entry missing for parent: {parent}");
            };
            let Some(entry) = per_parent.get_mut(&path) else {
                panic!("raised entry missing for path: {path}");
            };

            let remaining = entry.remove_contributor(id);
            if remaining > 0 {
                break;
            }
            per_parent.remove(&path);
            if per_parent.is_empty() {
                n.raised.remove(&parent);
            }

            decr = point;
            id = parent;
        }
    }

    /// Dispatch a full-match delta: forward to the parent when this node
    /// counts there, notify registered results, and lower projections.
    pub(crate) fn handle_full_delta(
        &mut self,
        node: NodeId,
        adds: Vec<ElementId>,
        removes: Vec<ElementId>,
        store: &dyn SourceIndexer,
    ) {
        if adds.is_empty() && removes.is_empty() {
            return;
        }

        sink::record(MetricsEvent::FullMatches {
            added: adds.len() as u64,
            removed: removes.len() as u64,
        });

        if let Some(parent) = self.intersection(node).parent
            && self.sub_counts_toward(parent, node)
        {
            if !removes.is_empty() {
                self.remove_matches(parent, node, &removes, store);
            }
            if !adds.is_empty() {
                self.add_matches(parent, node, &adds, store);
            }
        }

        for result in self.results_on(node) {
            self.push_delta(result, ProjId::MATCHES, DeltaKind::Remove, removes.clone());
            self.push_delta(result, ProjId::MATCHES, DeltaKind::Add, adds.clone());

            if self.node(node).is_projection() {
                for full in &removes {
                    self.lower_full(node, result, *full, DeltaKind::Remove, store);
                }
                for full in &adds {
                    self.lower_full(node, result, *full, DeltaKind::Add, store);
                }
            }
        }
    }

    /// Terminal match set changed: maintain projection membership against
    /// the current full matches, then feed the count tables.
    pub(crate) fn terminal_matches_changed(
        &mut self,
        terminal_id: NodeId,
        ids: &[ElementId],
        kind: DeltaKind,
        store: &dyn SourceIndexer,
    ) {
        let (parent, is_projection) = {
            let terminal = self.terminal(terminal_id);
            (terminal.parent, terminal.is_projection)
        };
        let Some(parent) = parent else {
            return;
        };
        // a terminal still pending its first refresh populates there instead
        if !self.intersection(parent).sub_nodes.contains(&terminal_id) {
            return;
        }

        // membership updates run before the count walks, against the full
        // set as it stands now (see project.rs for the ordering contract)
        if is_projection {
            let root = self.root_of(parent);
            for result in self.results_on(root) {
                self.membership_proj_update(root, terminal_id, result, ids, kind, store);
            }
        }

        if self.sub_counts_toward(parent, terminal_id) {
            match kind {
                DeltaKind::Add => self.add_matches(parent, terminal_id, ids, store),
                DeltaKind::Remove => self.remove_matches(parent, terminal_id, ids, store),
            }
        }
    }

    pub(crate) fn root_of(&self, node: NodeId) -> NodeId {
        let mut current = node;
        while let Some(parent) = self.node(current).parent() {
            current = parent;
        }
        current
    }
}
