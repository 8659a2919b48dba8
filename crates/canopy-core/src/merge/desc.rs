use derive_more::Display;

use crate::store::{GroupId, IdentificationId, IndexerId, PathId};

///
/// Priority
///
/// Mapping priority. At any `(target path, dominating)` slot only one
/// priority is mapped; higher wins.
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Priority(pub i32);

///
/// GroupDesc
///
/// The equivalence key of a merge group. Two mappings share a group exactly
/// when every field agrees; `prefix_group` chains descriptors from the
/// minimal group (shortest paths) to the maximal one.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct GroupDesc {
    pub(crate) source_indexer: IndexerId,
    pub(crate) prefix_group: Option<GroupId>,
    pub(crate) is_max: bool,
    pub(crate) is_identity: bool,
    pub(crate) source_path: PathId,
    pub(crate) target_path: PathId,
    pub(crate) priority: Priority,
    pub(crate) source_identification: Option<IdentificationId>,
    pub(crate) target_identification: Option<IdentificationId>,
}
