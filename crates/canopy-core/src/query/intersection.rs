//! Module: query::intersection
//! Responsibility: state of one intersection query-calc node: match counts,
//! match points, raised entries, projection tables, suspension snapshot.
//! Does not own: walk execution or refresh orchestration (graph-level).
//! Boundary: mutated exclusively through `QueryGraph` operations.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::store::{ElementId, PathId};

use super::{MatchPointTable, NodeId, ResultId};

///
/// RaisedEntry
///
/// Contribution record under `raised[parent][child_path]`. Selection match
/// points only need the contributor count; projection match points keep the
/// child ids so projection matches can be lowered back down.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum RaisedEntry {
    Count(u32),
    Children(BTreeSet<ElementId>),
}

impl RaisedEntry {
    pub(crate) const fn new(track_children: bool) -> Self {
        if track_children {
            Self::Children(BTreeSet::new())
        } else {
            Self::Count(0)
        }
    }

    #[must_use]
    pub(crate) fn contributors(&self) -> u32 {
        match self {
            Self::Count(count) => *count,
            Self::Children(children) => u32::try_from(children.len()).unwrap_or(u32::MAX),
        }
    }

    pub(crate) fn add_contributor(&mut self, child: ElementId) {
        match self {
            Self::Count(count) => *count += 1,
            Self::Children(children) => {
                children.insert(child);
            }
        }
    }

    /// Remove one contributor; returns the remaining count.
    pub(crate) fn remove_contributor(&mut self, child: ElementId) -> u32 {
        match self {
            Self::Count(count) => {
                assert!(*count > 0, "raised contributor count below zero");
                *count -= 1;
                *count
            }
            Self::Children(children) => {
                assert!(
                    children.remove(&child),
                    "raised contributor missing: {child}"
                );
                u32::try_from(children.len()).unwrap_or(u32::MAX)
            }
        }
    }
}

///
/// MatchMode
///
/// The add/remove implementation the node currently runs. Re-selected by
/// `set_mode` after any match-point change that can affect raising or
/// lowering.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum MatchMode {
    /// All match points are maximal; a count reaching the full match count
    /// is a full match without any walk.
    #[default]
    Linear,
    /// Some match point is below maximal (or a maximal one is not a
    /// projection match point): adds walk up through dominating elements.
    Raising,
    /// Refresh window: counts accumulate, nothing propagates outward.
    Suspended,
}

///
/// RemovedSub
///
/// Pre-removal classification of a sub-node leaving the intersection:
/// removal must unwind exactly what the sub had registered.
///

#[derive(Clone, Copy, Debug)]
pub(crate) struct RemovedSub {
    pub(crate) id: NodeId,
    pub(crate) was_projection: bool,
    pub(crate) was_counting: bool,
}

///
/// RefreshScratch
///
/// Per-refresh working state carried across the three phases.
///

#[derive(Debug, Default)]
pub(crate) struct RefreshScratch {
    pub(crate) new_subs: Vec<NodeId>,
    pub(crate) removed: Vec<RemovedSub>,
    pub(crate) became_projection: Vec<NodeId>,
    pub(crate) became_selection: Vec<NodeId>,
    pub(crate) initial: bool,
    pub(crate) proj_add_before: bool,
}

///
/// IntersectionNode
///
/// Maintains the set of data elements selected by the conjunction of its
/// sub-queries, raising matches through dominating elements where a
/// sub-path's match-point count has been satisfied.
///

#[derive(Debug, Default)]
pub(crate) struct IntersectionNode {
    pub(crate) parent: Option<NodeId>,
    pub(crate) sub_nodes: Vec<NodeId>,
    pub(crate) pending_subs: Vec<NodeId>,
    pub(crate) pending_removals: Vec<NodeId>,
    pub(crate) projection_subs: BTreeSet<NodeId>,
    /// Projection status of each sub as of the last refresh, for transition
    /// discovery.
    pub(crate) known_projection_subs: BTreeSet<NodeId>,

    pub(crate) matches: HashMap<ElementId, u32>,
    pub(crate) match_points: MatchPointTable,
    pub(crate) proj_match_points: MatchPointTable,
    pub(crate) pure_proj_match_points: BTreeSet<PathId>,
    pub(crate) raised: HashMap<ElementId, BTreeMap<PathId, RaisedEntry>>,
    pub(crate) proj_matches: HashMap<ResultId, HashMap<ElementId, u32>>,
    pub(crate) suspended_matches: Option<BTreeSet<ElementId>>,

    pub(crate) mode: MatchMode,
    /// Number of sub-nodes whose matches count toward the full match count.
    pub(crate) counting_subs: u32,
    /// Temporary inflation applied during the match-point refresh phase.
    pub(crate) inflation: u32,
    pub(crate) max_count_is_full_match: bool,
    pub(crate) needs_lowering: bool,
    pub(crate) proj_subs_add_matches: bool,

    /// Match points currently registered with the parent (this node's
    /// full-count match points).
    pub(crate) registered_match_points: Vec<PathId>,
    pub(crate) built: bool,
    pub(crate) refresh: Option<RefreshScratch>,
}

impl IntersectionNode {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub(crate) fn is_projection(&self) -> bool {
        !self.projection_subs.is_empty()
    }

    /// The count a data element must accumulate to be a full match.
    #[must_use]
    pub(crate) const fn full_match_count(&self) -> u32 {
        self.counting_subs + self.inflation
    }

    /// Whether projection sub-nodes must add their matches to the count
    /// tables: with several projections (or none but projections at all),
    /// each projection restricts the others' domination domain.
    #[must_use]
    pub(crate) fn sub_proj_must_add_matches(&self) -> bool {
        let projections = self.projection_subs.len();
        projections > 1 || (projections > 0 && projections == self.sub_nodes.len())
    }

    #[must_use]
    pub(crate) const fn is_suspended(&self) -> bool {
        matches!(self.mode, MatchMode::Suspended)
    }

    /// Whether an element whose count reached the full match count at this
    /// path is a full match (as opposed to a raise step).
    #[must_use]
    pub(crate) fn counts_as_full(&self, path_id: PathId) -> bool {
        self.max_count_is_full_match || self.proj_match_points.contains(path_id)
    }

    /// Re-select the add/remove implementation after a match-point change.
    /// Never overrides an active suspension.
    pub(crate) fn set_mode(&mut self) {
        let full = self.counting_subs;

        let full_paths = self.match_points.full_count_paths(full);
        let projection = self.is_projection();

        let raising = self.match_points.any_below(full)
            || (projection
                && full_paths
                    .iter()
                    .any(|path| !self.proj_match_points.contains(*path)));

        self.max_count_is_full_match = !projection
            || full_paths
                .iter()
                .all(|path| self.proj_match_points.contains(*path));

        self.needs_lowering = projection
            && self
                .proj_match_points
                .iter()
                .any(|(_, count)| count != full);

        self.pure_proj_match_points = self
            .proj_match_points
            .iter()
            .filter(|(path, _)| !self.match_points.contains(*path))
            .map(|(path, _)| path)
            .collect();

        if !self.is_suspended() {
            self.mode = if raising {
                MatchMode::Raising
            } else {
                MatchMode::Linear
            };
        }
    }

    /// The current full match set, computed from the count table.
    pub(crate) fn full_matches<F>(&self, path_of: F) -> BTreeSet<ElementId>
    where
        F: Fn(ElementId) -> Option<PathId>,
    {
        let full = self.full_match_count();
        if full == 0 {
            return BTreeSet::new();
        }

        self.matches
            .iter()
            .filter(|(id, count)| {
                **count == full
                    && path_of(**id).is_some_and(|path| self.counts_as_full(path))
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_entry_counts_and_children_agree() {
        let mut count = RaisedEntry::new(false);
        let mut children = RaisedEntry::new(true);

        count.add_contributor(ElementId(1));
        children.add_contributor(ElementId(1));
        count.add_contributor(ElementId(2));
        children.add_contributor(ElementId(2));

        assert_eq!(count.contributors(), children.contributors());
        assert_eq!(count.remove_contributor(ElementId(1)), 1);
        assert_eq!(children.remove_contributor(ElementId(1)), 1);
    }

    #[test]
    #[should_panic(expected = "raised contributor missing")]
    fn removing_unknown_child_aborts() {
        let mut children = RaisedEntry::new(true);
        children.add_contributor(ElementId(1));
        children.remove_contributor(ElementId(9));
    }

    #[test]
    fn projection_addition_rule() {
        let mut node = IntersectionNode::new();
        node.sub_nodes = vec![NodeId(0), NodeId(1)];
        node.projection_subs.insert(NodeId(0));
        assert!(!node.sub_proj_must_add_matches());

        node.projection_subs.insert(NodeId(1));
        assert!(node.sub_proj_must_add_matches());
    }
}
