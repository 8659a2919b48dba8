use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::{ElementId, Identity, PathId};

///
/// OperatorKind
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum OperatorKind {
    Negation,
    Range,
}

///
/// NodeKind
///
/// Operator nodes sit on the same path as their directly-dominated operands
/// and are non-terminal for merging purposes.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum NodeKind {
    Attributes,
    Terminal,
    Operator(OperatorKind),
}

impl NodeKind {
    #[must_use]
    pub const fn is_operator(self) -> bool {
        matches!(self, Self::Operator(_))
    }
}

///
/// NodeValue
///
/// The terminal key stored at a node. `None` for pure attribute carriers.
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum NodeValue {
    None,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl NodeValue {
    #[must_use]
    pub fn identity_bytes(&self) -> Vec<u8> {
        match self {
            Self::None => vec![0],
            Self::Bool(b) => vec![1, u8::from(*b)],
            Self::Int(i) => {
                let mut out = vec![2];
                out.extend_from_slice(&i.to_be_bytes());
                out
            }
            Self::Text(t) => {
                let mut out = vec![3];
                out.extend_from_slice(t.as_bytes());
                out
            }
        }
    }
}

///
/// NodeEntry
///
/// Per-element node record held by a path node: kind, terminal key, and
/// whether the element carries attribute children.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeEntry {
    pub kind: NodeKind,
    pub value: NodeValue,
    pub has_attrs: bool,
}

impl NodeEntry {
    #[must_use]
    pub const fn attributes() -> Self {
        Self {
            kind: NodeKind::Attributes,
            value: NodeValue::None,
            has_attrs: true,
        }
    }

    #[must_use]
    pub const fn terminal(value: NodeValue) -> Self {
        Self {
            kind: NodeKind::Terminal,
            value,
            has_attrs: false,
        }
    }

    #[must_use]
    pub const fn operator(kind: OperatorKind) -> Self {
        Self {
            kind: NodeKind::Operator(kind),
            value: NodeValue::None,
            has_attrs: false,
        }
    }

    /// Whether children of other groups may be merged under this node.
    #[must_use]
    pub const fn is_non_terminal(&self) -> bool {
        self.has_attrs || self.kind.is_operator()
    }
}

///
/// IdentityTable
///
/// Identity-keyed element sets, used for the per-path non-terminal and
/// data-element-operator tables on merge targets.
///

#[derive(Clone, Debug, Default, Deref, DerefMut)]
pub struct IdentityTable(HashMap<Identity, BTreeSet<ElementId>>);

impl IdentityTable {
    pub fn add(&mut self, identity: Identity, id: ElementId) {
        self.0.entry(identity).or_default().insert(id);
    }

    pub fn remove(&mut self, identity: Identity, id: ElementId) {
        if let Some(set) = self.0.get_mut(&identity) {
            set.remove(&id);
            if set.is_empty() {
                self.0.remove(&identity);
            }
        }
    }

    /// Move one element between identity buckets (identity update re-key).
    pub fn rekey(&mut self, old: Identity, new: Identity, id: ElementId) {
        self.remove(old, id);
        self.add(new, id);
    }

    #[must_use]
    pub fn ids(&self, identity: Identity) -> Vec<ElementId> {
        self.0
            .get(&identity)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

///
/// PathNode
///
/// Per-path store tables: the element node map, children indexed by
/// dominating element, trace/monitor flags, and the identity tables merging
/// resolves through.
///

#[derive(Debug)]
pub struct PathNode {
    pub path_id: PathId,
    pub nodes: HashMap<ElementId, NodeEntry>,
    pub children_by_parent: HashMap<Option<ElementId>, BTreeSet<ElementId>>,
    pub traced: bool,
    pub monitor_count: u32,
    // explicit merge-group targets pin the node regardless of content
    pub pin_count: u32,
    pub non_terminals: IdentityTable,
    pub operators: IdentityTable,
}

impl PathNode {
    #[must_use]
    pub fn new(path_id: PathId) -> Self {
        Self {
            path_id,
            nodes: HashMap::new(),
            children_by_parent: HashMap::new(),
            traced: false,
            monitor_count: 0,
            pin_count: 0,
            non_terminals: IdentityTable::default(),
            operators: IdentityTable::default(),
        }
    }

    pub fn insert(&mut self, id: ElementId, parent: Option<ElementId>, entry: NodeEntry) {
        self.nodes.insert(id, entry);
        self.children_by_parent.entry(parent).or_default().insert(id);
    }

    pub fn remove(&mut self, id: ElementId, parent: Option<ElementId>) -> Option<NodeEntry> {
        if let Some(set) = self.children_by_parent.get_mut(&parent) {
            set.remove(&id);
            if set.is_empty() {
                self.children_by_parent.remove(&parent);
            }
        }

        self.nodes.remove(&id)
    }

    #[must_use]
    pub fn children_of(&self, parent: Option<ElementId>) -> Vec<ElementId> {
        self.children_by_parent
            .get(&parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// A path node may be dropped once nothing references it.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        !self.traced && self.monitor_count == 0 && self.pin_count == 0 && self.nodes.is_empty()
    }
}
