use super::{ElementId, IdentificationId, Identity, IndexerId, NodeEntry, PathId};

///
/// ElementEntry
///
/// The slice of a data element a consumer needs for raising, domination
/// checks, and identity resolution.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ElementEntry {
    pub path_id: PathId,
    pub parent_id: Option<ElementId>,
    pub identity: Identity,
}

///
/// SourceIndexer
///
/// The read interface the query and merge cores consume. `TreeStore`
/// implements it directly; a merge indexer re-exposes its target store so
/// downstream query chains can mount onto merged data.
///

pub trait SourceIndexer {
    fn indexer_id(&self) -> IndexerId;

    /// Indexer ids this indexer derives its data from, transitively.
    /// Used for mapping cycle detection.
    fn upstream_ids(&self) -> Vec<IndexerId> {
        Vec::new()
    }

    fn depends_on(&self, other: IndexerId) -> bool {
        self.indexer_id() == other || self.upstream_ids().contains(&other)
    }

    fn entry(&self, id: ElementId) -> Option<ElementEntry>;

    fn node_entry(&self, id: ElementId) -> Option<&NodeEntry>;

    /// All element ids currently placed at a path.
    fn elements_at_path(&self, path_id: PathId) -> Vec<ElementId>;

    /// Whether the path currently carries any data elements.
    fn path_has_elements(&self, path_id: PathId) -> bool {
        !self.elements_at_path(path_id).is_empty()
    }

    /// Prefix chain of a path, root first, the path itself last.
    fn prefix_chain(&self, path_id: PathId) -> Vec<PathId>;

    /// Direct children of `dominating` placed at `child_path`.
    fn direct_child_elements(
        &self,
        dominating: Option<ElementId>,
        child_path: PathId,
    ) -> Vec<ElementId>;

    /// Elements at `source_path` dominated by one of `dominating`, where the
    /// dominating elements sit at (or above) `anchor_path`.
    fn dominated_nodes(
        &self,
        source_path: PathId,
        dominating: &[ElementId],
        anchor_path: PathId,
    ) -> Vec<ElementId>;

    fn base_identity(&self, id: ElementId) -> Identity;

    /// Identity under an identification overlay; falls back to the base
    /// identity when the overlay has no entry.
    fn identity(&self, identification: Option<IdentificationId>, id: ElementId) -> Identity;

    /// Whether the element lies inside a monitored sub-tree (self included).
    fn is_monitored(&self, id: ElementId) -> bool;
}
