//! Module: merge::group
//! Responsibility: per-group state: mapping registrations, source
//! reference counts, source-to-target translation, identity-node slots.
//! Does not own: the merge pipelines (indexer-level) or target storage.
//! Boundary: mutated exclusively by the owning merge indexer.

use std::collections::{BTreeSet, HashMap};

use crate::{
    query::{ProjId, ResultId},
    store::{ElementId, GroupId, Identity, PathId},
};

use super::{GroupDesc, Priority};

///
/// IdentitySlot
///
/// Key of one identity node: the source identity and, when the group merges
/// under a dominating identity, the parent identity.
///

pub(crate) type IdentitySlot = (Identity, Option<Identity>);

///
/// MergeGroup
///
/// The equivalence class of all mappings sharing one descriptor. Reference
/// counted through `mappings`; the last deregistration destroys the group
/// and everything it merged.
///

#[derive(Debug)]
pub(crate) struct MergeGroup {
    pub(crate) id: GroupId,
    pub(crate) desc: GroupDesc,
    /// Mapping registrations sharing this group (refcount by membership).
    pub(crate) mappings: BTreeSet<(ResultId, ProjId)>,
    /// Non-maximal groups: per-source reference counts from downstream
    /// additions.
    pub(crate) source_nodes: HashMap<ElementId, u32>,
    /// Authoritative `(source, dominating target) -> target` table.
    pub(crate) targets: HashMap<(ElementId, Option<ElementId>), ElementId>,
    /// Identity groups: identity slot -> identity node id.
    pub(crate) id_node_table: HashMap<IdentitySlot, ElementId>,
    /// Identity groups: per-source membership, for re-slotting on identity
    /// updates.
    pub(crate) id_members: HashMap<ElementId, IdentitySlot>,
    /// Slot each currently shelved source node was unmapped at, so removal
    /// and promotion find the unmapped-table entry without re-resolving.
    pub(crate) shelved: HashMap<ElementId, (Option<ElementId>, PathId)>,
    /// Forces freshly allocated target ids for every mapped node.
    pub(crate) obligatory: bool,
}

impl MergeGroup {
    pub(crate) fn new(id: GroupId, desc: GroupDesc) -> Self {
        Self {
            id,
            desc,
            mappings: BTreeSet::new(),
            source_nodes: HashMap::new(),
            targets: HashMap::new(),
            id_node_table: HashMap::new(),
            id_members: HashMap::new(),
            shelved: HashMap::new(),
            obligatory: false,
        }
    }

    #[must_use]
    pub(crate) const fn is_max(&self) -> bool {
        self.desc.is_max
    }

    #[must_use]
    pub(crate) const fn is_identity(&self) -> bool {
        self.desc.is_identity
    }

    #[must_use]
    pub(crate) const fn source_path(&self) -> PathId {
        self.desc.source_path
    }

    #[must_use]
    pub(crate) const fn target_path(&self) -> PathId {
        self.desc.target_path
    }

    #[must_use]
    pub(crate) const fn priority(&self) -> Priority {
        self.desc.priority
    }

    /// Count one downstream reference on a source node; true when this is
    /// the first (the node is newly referenced at this group's level).
    pub(crate) fn add_source_ref(&mut self, source: ElementId) -> bool {
        let count = self.source_nodes.entry(source).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one downstream reference; true when it was the last.
    pub(crate) fn remove_source_ref(&mut self, source: ElementId) -> bool {
        let Some(count) = self.source_nodes.get_mut(&source) else {
            panic!("source reference count missing: {source}");
        };
        assert!(*count > 0, "source reference count below zero: {source}");

        *count -= 1;
        if *count == 0 {
            self.source_nodes.remove(&source);
            true
        } else {
            false
        }
    }

    /// Target merged for a source, regardless of dominating context.
    #[must_use]
    pub(crate) fn target_of(&self, source: ElementId) -> Option<ElementId> {
        self.targets
            .iter()
            .find(|((s, _), _)| *s == source)
            .map(|(_, target)| *target)
    }

    #[must_use]
    pub(crate) fn target_under(
        &self,
        source: ElementId,
        dominating: Option<ElementId>,
    ) -> Option<ElementId> {
        self.targets.get(&(source, dominating)).copied()
    }

    pub(crate) fn record_target(
        &mut self,
        source: ElementId,
        dominating: Option<ElementId>,
        target: ElementId,
    ) {
        self.targets.insert((source, dominating), target);
    }

    /// Drop every `(source, _) -> target` entry pointing at a destroyed
    /// target element.
    pub(crate) fn forget_target(&mut self, target: ElementId) {
        self.targets.retain(|_, t| *t != target);
    }
}
