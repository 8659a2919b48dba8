//! Module: merge::indexer
//! Responsibility: mapping registration and group lifecycle: descriptor
//! interning, chain construction, cancellation, source rebasing.
//! Does not own: the addition/removal pipelines (add/remove) or tracing.
//! Boundary: the only owner of merge groups and the target store.

use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap},
    rc::Rc,
};
use thiserror::Error as ThisError;

use crate::{
    MAX_MAPPING_PAIRS,
    error::{EngineError, ErrorClass, ErrorOrigin},
    query::{ProjId, ResultId},
    store::{
        ElementId, GroupId, IdentificationId, IndexerId, Identity, PathId, SourceIndexer,
        TreeStore,
    },
};

use super::{GroupDesc, MergeGroup, Priority, UnmappedNodes};

///
/// MergeError
///

#[derive(Debug, ThisError)]
pub enum MergeError {
    #[error("no mapping registered for result {result} proj {proj}")]
    UnknownMapping { result: ResultId, proj: ProjId },

    #[error("mapping would create a dependency cycle with indexer {0}")]
    CyclicMapping(IndexerId),

    #[error("mapping vector invalid: {0}")]
    InvalidMapping(String),

    #[error("source element {element} has no dominating element at path {path}")]
    SourcePathMismatch { element: ElementId, path: PathId },
}

impl MergeError {
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownMapping { .. } | Self::SourcePathMismatch { .. } => ErrorClass::NotFound,
            Self::CyclicMapping(_) => ErrorClass::Conflict,
            Self::InvalidMapping(_) => ErrorClass::Unsupported,
        }
    }
}

impl From<MergeError> for EngineError {
    fn from(err: MergeError) -> Self {
        Self::new(err.class(), ErrorOrigin::Merge, err.to_string())
    }
}

///
/// MappingSpec
///
/// Registration parameters for `add_mapping`. The mapping vector holds
/// `(target path, source path)` pairs from the minimal pair to the maximal
/// one; an empty vector cancels the registration.
///

#[derive(Clone, Debug)]
pub struct MappingSpec {
    pub mapping: Vec<(PathId, PathId)>,
    pub priority: Priority,
    pub source_identification: Option<IdentificationId>,
    pub target_identification: Option<IdentificationId>,
    pub is_identity: bool,
    pub identity_only: bool,
}

impl MappingSpec {
    #[must_use]
    pub fn selection(mapping: Vec<(PathId, PathId)>, priority: Priority) -> Self {
        Self {
            mapping,
            priority,
            source_identification: None,
            target_identification: None,
            is_identity: false,
            identity_only: false,
        }
    }
}

///
/// MergeIndexer
///
/// Aggregates one or more projection outputs into a single tree-structured
/// target store, resolving priority conflicts and merging by identity.
///

pub struct MergeIndexer {
    pub(crate) target: Rc<RefCell<TreeStore>>,
    pub(crate) sources: HashMap<IndexerId, Rc<RefCell<TreeStore>>>,
    pub(crate) groups: HashMap<GroupId, MergeGroup>,
    pub(crate) group_by_desc: HashMap<GroupDesc, GroupId>,
    pub(crate) max_group_by_mapping: HashMap<(ResultId, ProjId), GroupId>,
    /// Reverse table: target element -> contributing `(group, source)` pairs.
    pub(crate) merged_by: HashMap<ElementId, Vec<(GroupId, ElementId)>>,
    pub(crate) unmapped: UnmappedNodes,
    pub(crate) non_extension_paths: BTreeSet<PathId>,
    /// Groups whose children below the explicit paths stop merging
    /// (identity-only registrations).
    pub(crate) identity_only_groups: BTreeSet<GroupId>,
    /// Consumer sub-tree monitor counts per target element.
    pub(crate) monitors: HashMap<ElementId, u32>,
    /// Targets materialized structurally (operator raising, extension
    /// merging, back-fill) rather than by a projection add. The first real
    /// add claims the structural reference instead of adding one.
    pub(crate) structural: BTreeSet<ElementId>,
    next_group: u32,
}

impl MergeIndexer {
    #[must_use]
    pub fn new(target: Rc<RefCell<TreeStore>>) -> Self {
        Self {
            target,
            sources: HashMap::new(),
            groups: HashMap::new(),
            group_by_desc: HashMap::new(),
            max_group_by_mapping: HashMap::new(),
            merged_by: HashMap::new(),
            unmapped: UnmappedNodes::default(),
            non_extension_paths: BTreeSet::new(),
            identity_only_groups: BTreeSet::new(),
            monitors: HashMap::new(),
            structural: BTreeSet::new(),
            next_group: 0,
        }
    }

    #[must_use]
    pub fn target(&self) -> Rc<RefCell<TreeStore>> {
        Rc::clone(&self.target)
    }

    #[must_use]
    pub fn indexer_id(&self) -> IndexerId {
        self.target.borrow().indexer_id()
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn unmapped_count(&self) -> usize {
        self.unmapped.len()
    }

    /// Register a mapping for `(result, proj)`. An empty mapping vector is
    /// the cancellation primitive and removes the registration instead.
    pub fn add_mapping(
        &mut self,
        result: ResultId,
        proj: ProjId,
        source: &Rc<RefCell<TreeStore>>,
        spec: &MappingSpec,
    ) -> Result<(), EngineError> {
        if spec.mapping.is_empty() {
            self.remove_mapping(result, Some(proj))?;
            return Ok(());
        }
        if spec.mapping.len() > MAX_MAPPING_PAIRS {
            return Err(MergeError::InvalidMapping(format!(
                "mapping vector exceeds {MAX_MAPPING_PAIRS} pairs"
            ))
            .into());
        }

        let source_id = source.borrow().indexer_id();
        let own_id = self.indexer_id();
        if source.borrow().depends_on(own_id) {
            return Err(MergeError::CyclicMapping(source_id).into());
        }

        // pair chain must extend monotonically on both sides
        {
            let store = source.borrow();
            let alloc = store.alloc();
            let alloc = alloc.borrow();
            for window in spec.mapping.windows(2) {
                let (prev_target, prev_source) = window[0];
                let (next_target, next_source) = window[1];
                if !alloc.is_prefix(prev_source, next_source)
                    || !alloc.is_prefix(prev_target, next_target)
                {
                    return Err(MergeError::InvalidMapping(
                        "mapping pairs must extend their prefix pair".to_string(),
                    )
                    .into());
                }
            }
        }

        let mut prefix: Option<GroupId> = None;
        let last = spec.mapping.len() - 1;
        for (index, (target_path, source_path)) in spec.mapping.iter().enumerate() {
            let desc = GroupDesc {
                source_indexer: source_id,
                prefix_group: prefix,
                is_max: index == last,
                is_identity: spec.is_identity && index == last,
                source_path: *source_path,
                target_path: *target_path,
                priority: spec.priority,
                source_identification: spec.source_identification,
                target_identification: spec.target_identification,
            };

            let gid = self.intern_group(desc);
            self.groups
                .get_mut(&gid)
                .unwrap_or_else(|| panic!("group vacated: {gid}"))
                .mappings
                .insert((result, proj));
            if spec.identity_only && index == last {
                self.identity_only_groups.insert(gid);
            }

            prefix = Some(gid);
        }

        let max_gid = prefix.unwrap_or_else(|| panic!("empty mapping chain"));
        self.max_group_by_mapping.insert((result, proj), max_gid);
        self.sources.insert(source_id, Rc::clone(source));
        self.target
            .borrow_mut()
            .record_upstream(std::iter::once(source_id).chain(source.borrow().upstream_ids()));

        Ok(())
    }

    /// Deregister `(result, proj)` (or every proj of `result`), removing all
    /// target state of groups whose last mapping leaves. Synchronous: all
    /// derived state is gone on return.
    pub fn remove_mapping(
        &mut self,
        result: ResultId,
        proj: Option<ProjId>,
    ) -> Result<(), EngineError> {
        let keys: Vec<(ResultId, ProjId)> = self
            .max_group_by_mapping
            .keys()
            .filter(|(r, p)| *r == result && proj.is_none_or(|wanted| *p == wanted))
            .copied()
            .collect();

        for key in keys {
            let Some(max_gid) = self.max_group_by_mapping.remove(&key) else {
                continue;
            };

            for gid in self.chain_of(max_gid) {
                let emptied = {
                    let group = self
                        .groups
                        .get_mut(&gid)
                        .unwrap_or_else(|| panic!("group vacated: {gid}"));
                    group.mappings.remove(&key);
                    group.mappings.is_empty()
                };
                if emptied {
                    self.destroy_group(gid);
                }
            }
        }

        Ok(())
    }

    /// Deregister every mapping.
    pub fn remove_all_mappings(&mut self) -> Result<(), EngineError> {
        let results: BTreeSet<ResultId> = self
            .max_group_by_mapping
            .keys()
            .map(|(result, _)| *result)
            .collect();
        for result in results {
            self.remove_mapping(result, None)?;
        }

        Ok(())
    }

    /// Rebase the mappings of `result` from one source prefix to another
    /// when the replacement is equivalence-preserving. Returns `false` when
    /// groups would need to be split or merged; the caller falls back to
    /// remove-then-add.
    pub fn replace_func_source(
        &mut self,
        result: ResultId,
        proj_mappings: &[ProjId],
        prev_prefix: PathId,
        prefix: PathId,
        source: &Rc<RefCell<TreeStore>>,
        source_identification: Option<IdentificationId>,
    ) -> Result<bool, EngineError> {
        let keys: Vec<(ResultId, ProjId)> = proj_mappings
            .iter()
            .map(|proj| (result, *proj))
            .collect();

        let mut affected: Vec<GroupId> = Vec::new();
        for key in &keys {
            let Some(max_gid) = self.max_group_by_mapping.get(key) else {
                return Err(MergeError::UnknownMapping {
                    result: key.0,
                    proj: key.1,
                }
                .into());
            };
            for gid in self.chain_of(*max_gid) {
                if !affected.contains(&gid) {
                    affected.push(gid);
                }
            }
        }

        // a group shared with unaffected mappings would have to split
        for gid in &affected {
            let group = &self.groups[gid];
            if group.mappings.iter().any(|key| !keys.contains(key)) {
                return Ok(false);
            }
        }

        let source_id = source.borrow().indexer_id();
        let alloc = source.borrow().alloc();

        // compute rebased descriptors; bail out when any would collide with
        // a group outside the affected set
        let mut rebased: Vec<(GroupId, GroupDesc)> = Vec::new();
        let mut new_prefix: HashMap<GroupId, Option<GroupId>> = HashMap::new();
        for gid in &affected {
            let old = self.groups[gid].desc;
            let Some(suffix) = alloc.borrow().diff(old.source_path, prev_prefix) else {
                return Ok(false);
            };
            let borrowed: Vec<&str> = suffix.iter().map(String::as_str).collect();
            let new_source_path = alloc
                .borrow_mut()
                .allocate_from(Some(prefix), &borrowed)
                .map_err(EngineError::from)?;

            let desc = GroupDesc {
                source_indexer: source_id,
                prefix_group: old.prefix_group.map(|p| {
                    new_prefix.get(&p).copied().flatten().unwrap_or(p)
                }),
                source_path: new_source_path,
                source_identification,
                ..old
            };

            if let Some(existing) = self.group_by_desc.get(&desc)
                && !affected.contains(existing)
            {
                return Ok(false);
            }

            new_prefix.insert(*gid, Some(*gid));
            rebased.push((*gid, desc));
        }

        // in-place rebase: ids stay, descriptors move
        for (gid, desc) in rebased {
            let old = self.groups[&gid].desc;
            self.group_by_desc.remove(&old);
            self.groups
                .get_mut(&gid)
                .unwrap_or_else(|| panic!("group vacated: {gid}"))
                .desc = desc;
            self.group_by_desc.insert(desc, gid);
        }
        self.sources.insert(source_id, Rc::clone(source));

        Ok(true)
    }

    /// Flag a target path as a non-extension path. Must be called before
    /// the path node exists in the target.
    pub fn add_non_extension_path(
        &mut self,
        prefix: PathId,
        attrs: &[&str],
    ) -> Result<PathId, EngineError> {
        let alloc = self.target.borrow().alloc();
        let path = alloc
            .borrow_mut()
            .allocate_from(Some(prefix), attrs)
            .map_err(EngineError::from)?;

        assert!(
            self.target.borrow().path_node(path).is_none(),
            "non-extension flag after path node creation: {path}"
        );
        self.non_extension_paths.insert(path);

        Ok(path)
    }

    // ---- group plumbing ----

    fn intern_group(&mut self, desc: GroupDesc) -> GroupId {
        if let Some(existing) = self.group_by_desc.get(&desc) {
            return *existing;
        }

        let gid = GroupId(self.next_group);
        self.next_group += 1;

        // the target path node is pinned for the group's lifetime
        {
            let mut target = self.target.borrow_mut();
            let alloc = target.alloc();
            let _ = alloc.borrow_mut().retain(desc.target_path);
            target.path_node_mut(desc.target_path).pin_count += 1;
        }

        // obligatory data elements: equal priority and prefix group onto
        // the same target path forces fresh target ids on both sides
        let twins: Vec<GroupId> = self
            .groups
            .values()
            .filter(|other| {
                other.desc.target_path == desc.target_path
                    && other.desc.priority == desc.priority
                    && other.desc.prefix_group == desc.prefix_group
            })
            .map(|other| other.id)
            .collect();

        let mut group = MergeGroup::new(gid, desc);
        if !twins.is_empty() {
            group.obligatory = true;
            for twin in twins {
                if let Some(other) = self.groups.get_mut(&twin) {
                    other.obligatory = true;
                }
            }
        }

        self.groups.insert(gid, group);
        self.group_by_desc.insert(desc, gid);

        gid
    }

    fn destroy_group(&mut self, gid: GroupId) {
        let Some(group) = self.groups.remove(&gid) else {
            return;
        };
        self.group_by_desc.remove(&group.desc);
        self.identity_only_groups.remove(&gid);
        self.unmapped.drop_group(gid);

        // tear down every target this group merged
        let mut targets: BTreeSet<ElementId> = group.targets.values().copied().collect();
        targets.extend(group.id_node_table.values().copied());
        for target in targets {
            if self.target.borrow().element(target).is_none() {
                continue;
            }
            let removed = self
                .target
                .borrow_mut()
                .force_remove(target)
                .unwrap_or_default();
            let contributors = self.merged_by.remove(&target).unwrap_or_default();
            for (g, _) in contributors {
                if g != gid && self.groups.contains_key(&g) {
                    self.group_mut(g).forget_target(target);
                }
            }
            self.cleanup_removed_targets(&removed, target);
        }

        let mut target = self.target.borrow_mut();
        let alloc = target.alloc();
        if target.path_node(group.desc.target_path).is_some() {
            let path = group.desc.target_path;
            let node = target.path_node_mut(path);
            node.pin_count = node.pin_count.saturating_sub(1);
            target.maybe_remove_path_node(path);
        }
        let _ = alloc.borrow_mut().release(group.desc.target_path);
    }

    /// The group chain from the maximal group down to the minimal one.
    pub(crate) fn chain_of(&self, max_gid: GroupId) -> Vec<GroupId> {
        let mut out = vec![max_gid];
        let mut current = max_gid;

        while let Some(prefix) = self.groups.get(&current).and_then(|g| g.desc.prefix_group) {
            out.push(prefix);
            current = prefix;
        }

        out
    }

    pub(crate) fn group(&self, gid: GroupId) -> &MergeGroup {
        self.groups
            .get(&gid)
            .unwrap_or_else(|| panic!("group vacated: {gid}"))
    }

    pub(crate) fn group_mut(&mut self, gid: GroupId) -> &mut MergeGroup {
        self.groups
            .get_mut(&gid)
            .unwrap_or_else(|| panic!("group vacated: {gid}"))
    }

    pub(crate) fn source_of(&self, gid: GroupId) -> Rc<RefCell<TreeStore>> {
        let indexer = self.group(gid).desc.source_indexer;
        Rc::clone(
            self.sources
                .get(&indexer)
                .unwrap_or_else(|| panic!("source indexer unregistered: {indexer}")),
        )
    }

    /// The priority currently mapped at a `(target path, dominating)` slot,
    /// derived from the mapped children's groups.
    pub(crate) fn mapped_priority_at(
        &self,
        target_path: PathId,
        dominating: Option<ElementId>,
    ) -> Option<Priority> {
        let target = self.target.borrow();
        let children = target.direct_child_elements(dominating, target_path);

        children.iter().find_map(|child| {
            let gid = target.element(*child)?.group_id?;
            self.groups.get(&gid).map(MergeGroup::priority)
        })
    }

    /// Walk a source element's dominating chain up to the element placed at
    /// `path`.
    pub(crate) fn raise_to_path(
        source: &TreeStore,
        id: ElementId,
        path: PathId,
    ) -> Result<ElementId, MergeError> {
        let mut current = id;

        loop {
            let Some(entry) = source.entry(current) else {
                return Err(MergeError::SourcePathMismatch { element: id, path });
            };
            if entry.path_id == path {
                return Ok(current);
            }
            let Some(parent) = entry.parent_id else {
                return Err(MergeError::SourcePathMismatch { element: id, path });
            };
            current = parent;
        }
    }

    /// Effective identity of a source element under a group's source
    /// identification.
    pub(crate) fn source_identity(
        &self,
        gid: GroupId,
        source: &TreeStore,
        id: ElementId,
    ) -> Identity {
        source.identity(self.group(gid).desc.source_identification, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorClass, test_support};

    fn paths(
        alloc: &Rc<RefCell<crate::store::PathAllocator>>,
    ) -> (PathId, PathId) {
        (
            test_support::path(alloc, &["s"]),
            test_support::path(alloc, &["t"]),
        )
    }

    #[test]
    fn mapping_onto_own_target_is_cyclic() {
        let alloc = test_support::alloc();
        let target = test_support::shared_store(&alloc, 1);
        let (path_s, path_t) = paths(&alloc);

        let mut merge = MergeIndexer::new(Rc::clone(&target));
        let own = merge.target();

        let err = merge
            .add_mapping(
                ResultId(0),
                ProjId(0),
                &own,
                &MappingSpec::selection(vec![(path_t, path_s)], Priority(1)),
            )
            .unwrap_err();

        assert_eq!(err.class, ErrorClass::Conflict);
    }

    #[test]
    fn empty_mapping_vector_cancels_registration() {
        let alloc = test_support::alloc();
        let source = test_support::shared_store(&alloc, 0);
        let target = test_support::shared_store(&alloc, 1);
        let (path_s, path_t) = paths(&alloc);

        let mut merge = MergeIndexer::new(target);
        merge
            .add_mapping(
                ResultId(0),
                ProjId(0),
                &source,
                &MappingSpec::selection(vec![(path_t, path_s)], Priority(1)),
            )
            .unwrap();
        assert_eq!(merge.group_count(), 1);

        merge
            .add_mapping(
                ResultId(0),
                ProjId(0),
                &source,
                &MappingSpec::selection(Vec::new(), Priority(1)),
            )
            .unwrap();
        assert_eq!(merge.group_count(), 0);
    }

    #[test]
    fn shared_descriptor_reuses_the_group() {
        let alloc = test_support::alloc();
        let source = test_support::shared_store(&alloc, 0);
        let target = test_support::shared_store(&alloc, 1);
        let (path_s, path_t) = paths(&alloc);

        let mut merge = MergeIndexer::new(target);
        let spec = MappingSpec::selection(vec![(path_t, path_s)], Priority(1));
        merge.add_mapping(ResultId(0), ProjId(0), &source, &spec).unwrap();
        merge.add_mapping(ResultId(1), ProjId(0), &source, &spec).unwrap();

        assert_eq!(merge.group_count(), 1);

        // the group survives until its last registration leaves
        merge.remove_mapping(ResultId(0), None).unwrap();
        assert_eq!(merge.group_count(), 1);
        merge.remove_mapping(ResultId(1), None).unwrap();
        assert_eq!(merge.group_count(), 0);
    }

    #[test]
    fn equal_priority_twins_become_obligatory() {
        let alloc = test_support::alloc();
        let source = test_support::shared_store(&alloc, 0);
        let target = test_support::shared_store(&alloc, 1);
        let path_s1 = test_support::path(&alloc, &["s1"]);
        let path_s2 = test_support::path(&alloc, &["s2"]);
        let path_t = test_support::path(&alloc, &["t"]);

        let mut merge = MergeIndexer::new(target);
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
                &MappingSpec::selection(vec![(path_t, path_s2)], Priority(1)),
            )
            .unwrap();

        assert!(merge.groups.values().all(|group| group.obligatory));
    }

    #[test]
    fn replace_func_source_rebases_in_place() {
        let alloc = test_support::alloc();
        let source = test_support::shared_store(&alloc, 0);
        let target = test_support::shared_store(&alloc, 1);

        let prev_prefix = test_support::path(&alloc, &["old"]);
        let path_s = test_support::path(&alloc, &["old", "s"]);
        let path_t = test_support::path(&alloc, &["t"]);
        let new_prefix = test_support::path(&alloc, &["new"]);

        let mut merge = MergeIndexer::new(target);
        merge
            .add_mapping(
                ResultId(0),
                ProjId(0),
                &source,
                &MappingSpec::selection(vec![(path_t, path_s)], Priority(1)),
            )
            .unwrap();

        let rebased = merge
            .replace_func_source(
                ResultId(0),
                &[ProjId(0)],
                prev_prefix,
                new_prefix,
                &source,
                None,
            )
            .unwrap();
        assert!(rebased);

        let expected = alloc.borrow().lookup(new_prefix, &["s"]).unwrap();
        let gid = merge.max_group_by_mapping[&(ResultId(0), ProjId(0))];
        assert_eq!(merge.group(gid).source_path(), expected);
    }

    #[test]
    fn replace_func_source_refuses_shared_groups() {
        let alloc = test_support::alloc();
        let source = test_support::shared_store(&alloc, 0);
        let target = test_support::shared_store(&alloc, 1);

        let prev_prefix = test_support::path(&alloc, &["old"]);
        let path_s = test_support::path(&alloc, &["old", "s"]);
        let path_t = test_support::path(&alloc, &["t"]);
        let new_prefix = test_support::path(&alloc, &["new"]);

        let mut merge = MergeIndexer::new(target);
        let spec = MappingSpec::selection(vec![(path_t, path_s)], Priority(1));
        merge.add_mapping(ResultId(0), ProjId(0), &source, &spec).unwrap();
        merge.add_mapping(ResultId(1), ProjId(0), &source, &spec).unwrap();

        // the group is shared with result 1: splitting is refused
        let rebased = merge
            .replace_func_source(
                ResultId(0),
                &[ProjId(0)],
                prev_prefix,
                new_prefix,
                &source,
                None,
            )
            .unwrap();
        assert!(!rebased);
    }
}
