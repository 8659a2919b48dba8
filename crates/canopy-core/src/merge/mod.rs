//! Module: merge
//! Responsibility: merging projection-result streams into a unified target
//! store: groups, priority conflicts, identity merging, tracing, identity
//! update propagation.
//! Does not own: query calculation or the source stores it reads.
//! Boundary: sources are read through shared store handles; the target is
//! exposed back as a source for downstream query chains.

mod add;
mod desc;
mod group;
mod identity;
mod indexer;
mod remove;
mod tracing;
mod unmapped;

pub use desc::Priority;
pub use indexer::{MappingSpec, MergeError, MergeIndexer};

pub(crate) use desc::GroupDesc;
pub(crate) use group::MergeGroup;
pub(crate) use unmapped::UnmappedNodes;

use std::cmp::Ordering;

use crate::store::{ElementId, GroupId};

///
/// DominatedOrdering
///
/// Ordering of dominated nodes under one target path. When several groups
/// map to the same path the smallest group id's ordering wins; a combined
/// multi-group ordering can slot in behind this seam later.
///

pub trait DominatedOrdering {
    fn compare(&self, a: ElementId, b: ElementId) -> Ordering;
}

///
/// GroupOrdering
///

#[derive(Clone, Copy, Debug)]
pub struct GroupOrdering {
    pub group: GroupId,
}

impl DominatedOrdering for GroupOrdering {
    fn compare(&self, a: ElementId, b: ElementId) -> Ordering {
        a.cmp(&b)
    }
}

impl MergeIndexer {
    /// The ordering governing dominated nodes at a target path: the
    /// smallest group id mapping there.
    #[must_use]
    pub fn dominated_ordering_at_path(
        &self,
        target_path: crate::store::PathId,
    ) -> Option<GroupOrdering> {
        self.groups
            .values()
            .filter(|group| group.desc.target_path == target_path)
            .map(|group| group.id)
            .min()
            .map(|group| GroupOrdering { group })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query::{ProjId, ResultId},
        test_support,
    };
    use std::rc::Rc;

    #[test]
    fn smallest_group_id_owns_shared_path_ordering() {
        let alloc = test_support::alloc();
        let source = test_support::shared_store(&alloc, 0);
        let target = test_support::shared_store(&alloc, 1);

        let path_s1 = test_support::path(&alloc, &["s1"]);
        let path_s2 = test_support::path(&alloc, &["s2"]);
        let path_t = test_support::path(&alloc, &["t"]);

        let mut merge = MergeIndexer::new(Rc::clone(&target));
        merge
            .add_mapping(
                ResultId(0),
                ProjId(0),
                &source,
                &MappingSpec::selection(vec![(path_t, path_s1)], Priority(1)),
            )
            .unwrap();
        merge
            .add_mapping(
                ResultId(0),
                ProjId(1),
                &source,
                &MappingSpec::selection(vec![(path_t, path_s2)], Priority(2)),
            )
            .unwrap();

        let ordering = merge.dominated_ordering_at_path(path_t).unwrap();
        assert_eq!(ordering.group, GroupId(0));
        assert_eq!(
            ordering.compare(ElementId(1), ElementId(2)),
            Ordering::Less
        );
    }
}
