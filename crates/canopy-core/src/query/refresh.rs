//! Module: query::refresh
//! Responsibility: the three-phase query refresh (structure discovery,
//! match-point reconciliation under inflation, match reconciliation), plus
//! standalone sub-node removal and dynamic match-point registration.
//! Boundary: phases are globally ordered; every structure refresh completes
//! before any match-point refresh, which completes before any match refresh.

use thiserror::Error as ThisError;

use crate::{
    error::{EngineError, ErrorClass, ErrorOrigin},
    obs::sink::{self, ExecKind, MetricsEvent, Span},
    store::{ElementId, PathId, SourceIndexer},
};

use super::{NodeId, QueryGraph, QueryNode, RefreshScratch, RemovedSub};

///
/// QueryError
///

#[derive(Debug, ThisError)]
pub enum QueryError {
    #[error("refresh requires a root intersection node: {0}")]
    NotARoot(NodeId),
}

impl QueryError {
    pub(crate) const fn class(&self) -> ErrorClass {
        ErrorClass::Conflict
    }
}

impl From<QueryError> for EngineError {
    fn from(err: QueryError) -> Self {
        Self::new(err.class(), ErrorOrigin::Refresh, err.to_string())
    }
}

impl QueryGraph {
    /// Drive a full three-phase refresh over the intersection tree under
    /// `root`: structure, then match points, then matches.
    pub fn refresh_query(
        &mut self,
        root: NodeId,
        store: &dyn SourceIndexer,
    ) -> Result<(), EngineError> {
        if self.node(root).parent().is_some()
            || !matches!(self.node(root), QueryNode::Intersection(_))
        {
            return Err(QueryError::NotARoot(root).into());
        }

        let _span = Span::new(ExecKind::Refresh);

        self.structure_refresh(root, store);
        self.match_point_refresh(root, store);
        self.match_refresh(root, store);

        Ok(())
    }

    // ---- phase 1: structure ----

    fn structure_refresh(&mut self, node: NodeId, store: &dyn SourceIndexer) {
        let (initial, new_subs, removed_ids, proj_add_before) = {
            let n = self.intersection_mut(node);
            (
                !n.built,
                std::mem::take(&mut n.pending_subs),
                std::mem::take(&mut n.pending_removals),
                n.proj_subs_add_matches,
            )
        };

        // selection <-> projection transitions among continuing subs
        let mut became_projection = Vec::new();
        let mut became_selection = Vec::new();
        for sub in self.intersection(node).sub_nodes.clone() {
            if removed_ids.contains(&sub) {
                continue;
            }
            let was = self.intersection(node).known_projection_subs.contains(&sub);
            let is = self.node(sub).is_projection();
            if is && !was {
                became_projection.push(sub);
            } else if was && !is {
                became_selection.push(sub);
            }
        }

        let removed: Vec<RemovedSub> = removed_ids
            .iter()
            .map(|sub| {
                let was_projection =
                    self.intersection(node).known_projection_subs.contains(sub);
                RemovedSub {
                    id: *sub,
                    was_projection,
                    was_counting: !was_projection || proj_add_before,
                }
            })
            .collect();

        // apply the structural wiring now; tables follow in later phases
        {
            let n = self.intersection_mut(node);
            for sub in &removed_ids {
                n.sub_nodes.retain(|existing| existing != sub);
            }
            n.sub_nodes.extend(new_subs.iter().copied());
        }
        let projection_flags: Vec<(NodeId, bool)> = self
            .intersection(node)
            .sub_nodes
            .clone()
            .into_iter()
            .map(|sub| (sub, self.node(sub).is_projection()))
            .collect();
        {
            let n = self.intersection_mut(node);
            n.projection_subs = projection_flags
                .iter()
                .filter(|(_, projection)| *projection)
                .map(|(sub, _)| *sub)
                .collect();
        }

        let structural = !new_subs.is_empty()
            || !removed.is_empty()
            || !became_projection.is_empty()
            || !became_selection.is_empty();

        self.intersection_mut(node).refresh = Some(RefreshScratch {
            new_subs,
            removed,
            became_projection,
            became_selection,
            initial,
            proj_add_before,
        });

        if structural && !initial {
            self.suspend(node, store);
        }

        for sub in self.intersection(node).sub_nodes.clone() {
            if matches!(self.node(sub), QueryNode::Intersection(_)) {
                self.structure_refresh(sub, store);
            }
        }
    }

    // ---- phase 2: match points ----

    fn match_point_refresh(&mut self, node: NodeId, store: &dyn SourceIndexer) {
        let Some(scratch) = self.intersection_mut(node).refresh.take() else {
            return;
        };

        // every built node is suspended across the match-point window; the
        // inflation below keeps transient counts away from the maximum
        if self.intersection(node).built {
            self.suspend(node, store);
        }
        self.intersection_mut(node).inflation += 2;

        // removed subs: unwind exactly what they had registered
        for removed in scratch.removed.clone() {
            let paths = self.sub_registered_points(removed.id);
            {
                let n = self.intersection_mut(node);
                for path in &paths {
                    if removed.was_projection {
                        n.proj_match_points.remove(*path);
                    }
                    if removed.was_counting {
                        n.match_points.remove(*path);
                    }
                }
                if removed.was_counting {
                    n.counting_subs -= 1;
                }
            }
            self.set_sub_registered_points(removed.id, Vec::new());
        }

        // recompute whether projection subs add their matches
        let proj_add_now = self.intersection(node).sub_proj_must_add_matches();
        let proj_add_before = scratch.proj_add_before;
        self.intersection_mut(node).proj_subs_add_matches = proj_add_now;

        if proj_add_before != proj_add_now {
            let continuing: Vec<NodeId> = self
                .intersection(node)
                .projection_subs
                .iter()
                .copied()
                .filter(|sub| {
                    !scratch.new_subs.contains(sub) && !scratch.became_projection.contains(sub)
                })
                .collect();
            for sub in continuing {
                let paths = self.sub_registered_points(sub);
                let n = self.intersection_mut(node);
                if proj_add_now {
                    for path in &paths {
                        n.match_points.add(*path);
                    }
                    n.counting_subs += 1;
                } else {
                    for path in &paths {
                        n.match_points.remove(*path);
                    }
                    n.counting_subs -= 1;
                }
            }
        }

        // selection -> projection: points move into the projection table and
        // (unless projections add their matches) out of the count table
        for sub in scratch.became_projection.clone() {
            let paths = self.sub_registered_points(sub);
            let n = self.intersection_mut(node);
            for path in &paths {
                n.proj_match_points.add(*path);
            }
            if !proj_add_now {
                for path in &paths {
                    n.match_points.remove(*path);
                }
                n.counting_subs -= 1;
            }
        }

        // projection -> selection: the inverse
        for sub in scratch.became_selection.clone() {
            let paths = self.sub_registered_points(sub);
            let n = self.intersection_mut(node);
            for path in &paths {
                n.proj_match_points.remove(*path);
            }
            if !proj_add_before {
                for path in &paths {
                    n.match_points.add(*path);
                }
                n.counting_subs += 1;
            }
        }

        // continuing subs: reconcile registrations, recurse
        let continuing: Vec<NodeId> = self
            .intersection(node)
            .sub_nodes
            .clone()
            .into_iter()
            .filter(|sub| !scratch.new_subs.contains(sub))
            .collect();
        for sub in continuing {
            match self.node(sub) {
                QueryNode::Terminal(_) => self.reconcile_terminal_points(node, sub, store),
                QueryNode::Intersection(_) => self.match_point_refresh(sub, store),
            }
        }

        // new subs: register their existing points first, then recurse
        for sub in scratch.new_subs.clone() {
            let counting = !self.intersection(node).projection_subs.contains(&sub) || proj_add_now;

            match self.node(sub) {
                QueryNode::Terminal(_) => {
                    let paths = {
                        let terminal = self.terminal(sub);
                        terminal.current_match_points(store)
                    };
                    self.active_paths.extend(paths.iter().copied());
                    for path in &paths {
                        self.register_sub_point(node, sub, *path, true);
                    }
                    self.terminal_mut(sub).registered_match_points = paths;
                }
                QueryNode::Intersection(_) => {
                    let paths = self.intersection(sub).registered_match_points.clone();
                    for path in &paths {
                        self.register_sub_point(node, sub, *path, true);
                    }
                    self.match_point_refresh(sub, store);
                }
            }

            if counting {
                self.intersection_mut(node).counting_subs += 1;
            }
        }

        {
            let n = self.intersection_mut(node);
            n.inflation -= 2;
            n.set_mode();
        }

        self.intersection_mut(node).refresh = Some(scratch);
        self.register_points_with_parent(node);
    }

    /// Diff a terminal's current match points against its registration.
    fn reconcile_terminal_points(
        &mut self,
        node: NodeId,
        sub: NodeId,
        store: &dyn SourceIndexer,
    ) {
        let current = self.terminal(sub).current_match_points(store);
        let previous = self.terminal(sub).registered_match_points.clone();
        self.active_paths.extend(current.iter().copied());
        if current == previous {
            return;
        }

        for path in previous.iter().filter(|path| !current.contains(path)) {
            self.register_sub_point(node, sub, *path, false);
        }
        for path in current.iter().filter(|path| !previous.contains(path)) {
            self.register_sub_point(node, sub, *path, true);
        }

        self.terminal_mut(sub).registered_match_points = current;
    }

    /// Apply one match-point registration for a sub, honoring its
    /// classification (selection vs projection, adding or not).
    pub(crate) fn register_sub_point(
        &mut self,
        node: NodeId,
        sub: NodeId,
        path: PathId,
        add: bool,
    ) {
        let n = self.intersection_mut(node);
        let is_projection = n.projection_subs.contains(&sub);
        let counting = !is_projection || n.proj_subs_add_matches;

        if is_projection {
            if add {
                n.proj_match_points.add(path);
            } else {
                n.proj_match_points.remove(path);
            }
        }
        if counting {
            if add {
                n.match_points.add(path);
            } else {
                n.match_points.remove(path);
            }
        }

        sink::record(MetricsEvent::MatchPointChange { added: add });
    }

    /// Register the node's full-count match-point diff with its parent.
    /// Inside a refresh the parent is inflated and suspended, so raw table
    /// updates suffice.
    fn register_points_with_parent(&mut self, node: NodeId) {
        let after = {
            let n = self.intersection(node);
            n.match_points.full_count_paths(n.counting_subs)
        };
        let before = self.intersection(node).registered_match_points.clone();
        if after == before {
            return;
        }

        if let Some(parent) = self.intersection(node).parent {
            for path in before.iter().filter(|path| !after.contains(path)) {
                self.register_sub_point(parent, node, *path, false);
            }
            for path in after.iter().filter(|path| !before.contains(path)) {
                self.register_sub_point(parent, node, *path, true);
            }
        }

        self.intersection_mut(node).registered_match_points = after;
    }

    // ---- phase 3: matches ----

    fn match_refresh(&mut self, node: NodeId, store: &dyn SourceIndexer) {
        let Some(scratch) = self.intersection_mut(node).refresh.take() else {
            return;
        };

        // removed sub-node matches go first, using pre-removal state
        for removed in &scratch.removed {
            let ids = self.sub_matched_set(removed.id, store);
            if removed.was_counting && !ids.is_empty() {
                self.remove_matches(node, removed.id, &ids, store);
            }
            self.vacate_subtree(removed.id);
        }

        // projections-add flag transitions apply to continuing projections
        let proj_add_now = self.intersection(node).proj_subs_add_matches;
        if scratch.proj_add_before != proj_add_now {
            let continuing: Vec<NodeId> = self
                .intersection(node)
                .projection_subs
                .iter()
                .copied()
                .filter(|sub| {
                    !scratch.new_subs.contains(sub) && !scratch.became_projection.contains(sub)
                })
                .collect();
            for sub in continuing {
                let ids = self.sub_matched_set(sub, store);
                if ids.is_empty() {
                    continue;
                }
                if proj_add_now {
                    self.add_matches(node, sub, &ids, store);
                } else {
                    self.remove_matches(node, sub, &ids, store);
                }
            }
        }

        // transitions: matches follow the counting status
        for sub in scratch.became_projection.clone() {
            if !proj_add_now {
                let ids = self.sub_matched_set(sub, store);
                if !ids.is_empty() {
                    self.remove_matches(node, sub, &ids, store);
                }
            }
        }
        for sub in scratch.became_selection.clone() {
            if !scratch.proj_add_before {
                let ids = self.sub_matched_set(sub, store);
                if !ids.is_empty() {
                    self.add_matches(node, sub, &ids, store);
                }
            }
        }

        // new subs: populate terminals, add pre-existing matches, recurse
        for sub in scratch.new_subs.clone() {
            let counting = self.sub_counts_toward(node, sub);

            match self.node(sub) {
                QueryNode::Terminal(_) => {
                    let ids: Vec<ElementId> = {
                        let matches = self.terminal(sub).matches_from_store(store);
                        self.terminal_mut(sub).matches = matches.clone();
                        matches.into_iter().collect()
                    };
                    if counting && !ids.is_empty() {
                        self.add_matches(node, sub, &ids, store);
                    }
                }
                QueryNode::Intersection(_) => {
                    let ids = self.sub_matched_set(sub, store);
                    if counting && !ids.is_empty() {
                        self.add_matches(node, sub, &ids, store);
                    }
                    self.match_refresh(sub, store);
                }
            }
        }

        // continuing sub intersections recurse; their unsuspension feeds
        // this node while it is still suspended
        let continuing: Vec<NodeId> = self
            .intersection(node)
            .sub_nodes
            .clone()
            .into_iter()
            .filter(|sub| {
                !scratch.new_subs.contains(sub)
                    && matches!(self.node(*sub), QueryNode::Intersection(_))
            })
            .collect();
        for sub in continuing {
            self.match_refresh(sub, store);
        }

        {
            let n = self.intersection_mut(node);
            n.known_projection_subs = n.projection_subs.clone();
            n.built = true;
        }
        self.unsuspend(node, store);
    }

    // ---- standalone sub-node removal ----

    /// Remove a sub-node outside the refresh cycle: suspend, unwind the
    /// sub's match points and matches using its pre-removal state, handle
    /// projection bookkeeping transitions, unsuspend.
    pub fn update_query_after_node_removal(
        &mut self,
        node: NodeId,
        sub: NodeId,
        store: &dyn SourceIndexer,
    ) -> Result<(), EngineError> {
        // a sub that never made it past attach just unlinks
        if self.intersection(node).pending_subs.contains(&sub) {
            self.intersection_mut(node)
                .pending_subs
                .retain(|existing| *existing != sub);
            self.vacate_subtree(sub);
            return Ok(());
        }

        let was_projection = self.intersection(node).projection_subs.contains(&sub);
        let proj_add_before = self.intersection(node).proj_subs_add_matches;
        let was_counting = !was_projection || proj_add_before;
        let built = self.intersection(node).built;

        if built {
            self.suspend(node, store);
        }

        {
            let n = self.intersection_mut(node);
            n.sub_nodes.retain(|existing| *existing != sub);
            n.projection_subs.remove(&sub);
            n.known_projection_subs.remove(&sub);
        }

        // unwind the sub's registrations
        let paths = self.sub_registered_points(sub);
        {
            let n = self.intersection_mut(node);
            for path in &paths {
                if was_projection {
                    n.proj_match_points.remove(*path);
                }
                if was_counting {
                    n.match_points.remove(*path);
                }
            }
            if was_counting {
                n.counting_subs -= 1;
            }
        }

        // projections-must-add going false: remaining projections stop
        // counting
        let proj_add_now = self.intersection(node).sub_proj_must_add_matches();
        if proj_add_before && !proj_add_now {
            self.intersection_mut(node).proj_subs_add_matches = false;
            for remaining in self.intersection(node).projection_subs.clone() {
                let sub_paths = self.sub_registered_points(remaining);
                {
                    let n = self.intersection_mut(node);
                    for path in &sub_paths {
                        n.match_points.remove(*path);
                    }
                    n.counting_subs -= 1;
                }
                let ids = self.sub_matched_set(remaining, store);
                if !ids.is_empty() {
                    self.remove_matches(node, remaining, &ids, store);
                }
            }
        } else {
            self.intersection_mut(node).proj_subs_add_matches = proj_add_now;
        }

        // the sub's matches, using its pre-removal state
        let ids = self.sub_matched_set(sub, store);
        if was_counting && !ids.is_empty() {
            self.remove_matches(node, sub, &ids, store);
        }

        self.intersection_mut(node).set_mode();
        self.propagate_registered_points(node, store);

        if built {
            self.unsuspend(node, store);
        }

        // a projection-status change of this node is visible to its parent
        // through the next refresh of the query root
        let root = self.root_of(node);
        self.vacate_subtree(sub);
        if root != node && was_projection && !self.intersection(node).is_projection() {
            self.refresh_query(root, store)?;
        }

        Ok(())
    }

    // ---- dynamic match-point registration ----

    /// Register a path on a node's match-point tables on behalf of a sub.
    /// Wraps the node in a suspension window when it is live.
    pub fn add_to_match_points(
        &mut self,
        node: NodeId,
        path: PathId,
        source: NodeId,
        store: &dyn SourceIndexer,
    ) {
        self.change_match_point(node, path, source, true, store);
    }

    /// Inverse of `add_to_match_points`.
    pub fn remove_from_match_points(
        &mut self,
        node: NodeId,
        path: PathId,
        source: NodeId,
        store: &dyn SourceIndexer,
    ) {
        self.change_match_point(node, path, source, false, store);
    }

    fn change_match_point(
        &mut self,
        node: NodeId,
        path: PathId,
        source: NodeId,
        add: bool,
        store: &dyn SourceIndexer,
    ) {
        let wrap = self.intersection(node).built && !self.intersection(node).is_suspended();
        if wrap {
            self.suspend(node, store);
        }

        self.register_sub_point(node, source, path, add);
        self.intersection_mut(node).set_mode();
        self.propagate_registered_points(node, store);

        if wrap {
            self.unsuspend(node, store);
        }
    }

    /// A path flipped its carrying-data status: reconcile one terminal's
    /// registration against its parent, inside a suspension window.
    pub(crate) fn refresh_terminal_match_points(
        &mut self,
        terminal_id: NodeId,
        store: &dyn SourceIndexer,
    ) {
        let Some(parent) = self.terminal(terminal_id).parent else {
            return;
        };
        if !self.intersection(parent).sub_nodes.contains(&terminal_id) {
            return;
        }

        let current = self.terminal(terminal_id).current_match_points(store);
        let previous = self.terminal(terminal_id).registered_match_points.clone();
        if current == previous {
            return;
        }

        let wrap = self.intersection(parent).built && !self.intersection(parent).is_suspended();
        if wrap {
            self.suspend(parent, store);
        }

        for path in previous.iter().filter(|path| !current.contains(path)) {
            self.register_sub_point(parent, terminal_id, *path, false);
        }
        for path in current.iter().filter(|path| !previous.contains(path)) {
            self.register_sub_point(parent, terminal_id, *path, true);
        }
        self.terminal_mut(terminal_id).registered_match_points = current;

        self.intersection_mut(parent).set_mode();
        self.propagate_registered_points(parent, store);

        if wrap {
            self.unsuspend(parent, store);
        }
    }

    /// Propagate a changed full-count match-point set up the parent chain,
    /// wrapping live ancestors in suspension windows.
    pub(crate) fn propagate_registered_points(&mut self, node: NodeId, store: &dyn SourceIndexer) {
        let after = {
            let n = self.intersection(node);
            n.match_points.full_count_paths(n.counting_subs)
        };
        let before = self.intersection(node).registered_match_points.clone();
        if after == before {
            return;
        }

        let Some(parent) = self.intersection(node).parent else {
            self.intersection_mut(node).registered_match_points = after;
            return;
        };

        let wrap = self.intersection(parent).built && !self.intersection(parent).is_suspended();
        if wrap {
            self.suspend(parent, store);
        }

        for path in before.iter().filter(|path| !after.contains(path)) {
            self.register_sub_point(parent, node, *path, false);
        }
        for path in after.iter().filter(|path| !before.contains(path)) {
            self.register_sub_point(parent, node, *path, true);
        }
        self.intersection_mut(node).registered_match_points = after;

        self.intersection_mut(parent).set_mode();
        self.propagate_registered_points(parent, store);

        if wrap {
            self.unsuspend(parent, store);
        }
    }

    // ---- shared helpers ----

    pub(crate) fn sub_registered_points(&self, sub: NodeId) -> Vec<PathId> {
        match self.node(sub) {
            QueryNode::Terminal(terminal) => terminal.registered_match_points.clone(),
            QueryNode::Intersection(intersection) => {
                intersection.registered_match_points.clone()
            }
        }
    }

    fn set_sub_registered_points(&mut self, sub: NodeId, paths: Vec<PathId>) {
        match self.node_mut(sub) {
            QueryNode::Terminal(terminal) => terminal.registered_match_points = paths,
            QueryNode::Intersection(intersection) => {
                intersection.registered_match_points = paths;
            }
        }
    }

    /// The matched set a sub currently forwards (terminal matches or the
    /// intersection's full matches).
    pub(crate) fn sub_matched_set(
        &self,
        sub: NodeId,
        store: &dyn SourceIndexer,
    ) -> Vec<ElementId> {
        self.matches_set(sub, store).into_iter().collect()
    }

    /// Drop a node and every node below it from the arena.
    pub(crate) fn vacate_subtree(&mut self, node: NodeId) {
        let subs = match self.node(node) {
            QueryNode::Terminal(_) => Vec::new(),
            QueryNode::Intersection(intersection) => {
                let mut all = intersection.sub_nodes.clone();
                all.extend(intersection.pending_subs.iter().copied());
                all
            }
        };

        for sub in subs {
            self.vacate_subtree(sub);
        }
        self.node_mut(node).set_parent(None);
        self.vacate(node);
    }
}
