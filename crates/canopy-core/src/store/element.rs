use derive_more::{Deref, DerefMut};
use std::collections::HashMap;

use super::{ElementId, GroupId, Identity, PathId};

///
/// DataElement
///
/// A node in the hierarchical store, addressed by `(path_id, id)`. The
/// dominating element is the parent in the store tree. Elements produced by
/// merging carry their group and origin id.
///

#[derive(Clone, Debug)]
pub struct DataElement {
    pub id: ElementId,
    pub path_id: PathId,
    pub parent_id: Option<ElementId>,
    pub identity: Identity,
    pub group_id: Option<GroupId>,
    pub source_id: Option<ElementId>,
    pub ref_count: u32,
}

impl DataElement {
    #[must_use]
    pub const fn new(id: ElementId, path_id: PathId, parent_id: Option<ElementId>) -> Self {
        Self {
            id,
            path_id,
            parent_id,
            identity: Identity::of_element(id),
            group_id: None,
            source_id: None,
            ref_count: 1,
        }
    }
}

///
/// ElementTable
///

#[derive(Debug, Default, Deref, DerefMut)]
pub struct ElementTable(HashMap<ElementId, DataElement>);

impl ElementTable {
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }
}
