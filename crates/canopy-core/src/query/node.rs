use derive_more::Display;
use std::collections::BTreeSet;

use crate::store::{ElementId, NodeValue, PathId, SourceIndexer};

use super::intersection::IntersectionNode;

///
/// NodeId
///
/// Arena index of a query-calculation node within one `QueryGraph`.
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub u32);

///
/// ResultId
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResultId(pub u32);

///
/// ProjId
///
/// Identifies one projection site under a result. The reserved `MATCHES`
/// value carries the root-level selection match stream.
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProjId(pub u32);

impl ProjId {
    pub const MATCHES: Self = Self(u32::MAX);
}

///
/// ValuePredicate
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValuePredicate {
    /// Matches every element at the terminal's path.
    Any,
    /// Matches terminal nodes whose key equals the given value.
    Eq(NodeValue),
}

impl ValuePredicate {
    #[must_use]
    pub(crate) fn matches(&self, store: &dyn SourceIndexer, id: ElementId) -> bool {
        match self {
            Self::Any => true,
            Self::Eq(value) => store
                .node_entry(id)
                .is_some_and(|entry| entry.value == *value),
        }
    }
}

///
/// TerminalNode
///
/// Simple selection/projection leaf: selects elements at one path, optionally
/// filtered by their terminal key. Forwards its match updates to the parent
/// when it counts toward the intersection.
///

#[derive(Debug)]
pub(crate) struct TerminalNode {
    pub(crate) parent: Option<NodeId>,
    pub(crate) path: PathId,
    pub(crate) predicate: ValuePredicate,
    pub(crate) is_projection: bool,
    pub(crate) matches: BTreeSet<ElementId>,
    /// Match points currently registered with the parent.
    pub(crate) registered_match_points: Vec<PathId>,
}

impl TerminalNode {
    pub(crate) fn new(path: PathId, predicate: ValuePredicate, is_projection: bool) -> Self {
        Self {
            parent: None,
            path,
            predicate,
            is_projection,
            matches: BTreeSet::new(),
            registered_match_points: Vec::new(),
        }
    }

    /// Match points this terminal should currently register: every prefix of
    /// its path that carries data elements, the root unconditionally.
    pub(crate) fn current_match_points(&self, store: &dyn SourceIndexer) -> Vec<PathId> {
        store
            .prefix_chain(self.path)
            .into_iter()
            .filter(|path| path.is_root() || store.path_has_elements(*path))
            .collect()
    }

    /// Recompute the full match set from the store.
    pub(crate) fn matches_from_store(&self, store: &dyn SourceIndexer) -> BTreeSet<ElementId> {
        store
            .elements_at_path(self.path)
            .into_iter()
            .filter(|id| self.predicate.matches(store, *id))
            .collect()
    }
}

///
/// QueryNode
///
/// Tagged sum over query-calc node kinds; the arena owns every node and
/// links them through explicit ids.
///

#[derive(Debug)]
pub(crate) enum QueryNode {
    Terminal(TerminalNode),
    Intersection(IntersectionNode),
}

impl QueryNode {
    #[must_use]
    pub(crate) const fn parent(&self) -> Option<NodeId> {
        match self {
            Self::Terminal(node) => node.parent,
            Self::Intersection(node) => node.parent,
        }
    }

    pub(crate) const fn set_parent(&mut self, parent: Option<NodeId>) {
        match self {
            Self::Terminal(node) => node.parent = parent,
            Self::Intersection(node) => node.parent = parent,
        }
    }

    #[must_use]
    pub(crate) fn is_projection(&self) -> bool {
        match self {
            Self::Terminal(node) => node.is_projection,
            Self::Intersection(node) => node.is_projection(),
        }
    }
}
