//! Module: merge::identity
//! Responsibility: identity update propagation: re-keying mapped targets,
//! re-slotting identity nodes, updating unmapped entries, and re-resolving
//! dominating nodes matched by identity.
//! Ordering: mapped-target, then identity-node, then unmapped, then
//! undominated-child; this order is part of the contract.

use std::collections::HashMap;

use crate::{
    error::EngineError,
    obs::sink::{self, MetricsEvent},
    store::{ElementId, GroupId, IdentificationId, Identity, SourceIndexer},
};

use super::{MergeIndexer, add::MergeOutcome};

impl MergeIndexer {
    /// Propagate a source identity change under `identification` for the
    /// given `(element, new identity)` pairs. The source store must already
    /// hold the new identities.
    pub fn update_source_identities(
        &mut self,
        identification: IdentificationId,
        changes: &[(ElementId, Identity)],
    ) -> Result<(), EngineError> {
        sink::record(MetricsEvent::IdentityUpdate);

        let change_map: HashMap<ElementId, Identity> = changes.iter().copied().collect();
        let affected: Vec<GroupId> = self
            .groups
            .values()
            .filter(|group| group.desc.source_identification == Some(identification))
            .map(|group| group.id)
            .collect();

        // 1. mapped targets of plain groups take the new base identity
        for gid in &affected {
            if self.group(*gid).is_identity() {
                continue;
            }
            let mapped: Vec<(ElementId, ElementId)> = self
                .group(*gid)
                .targets
                .iter()
                .filter(|((source, _), _)| change_map.contains_key(source))
                .map(|((source, _), target)| (*source, *target))
                .collect();

            for (source, target) in mapped {
                let new = change_map[&source];
                self.rekey_target_identity(target, new);
            }
        }

        // 2. identity groups re-slot their members
        for gid in &affected {
            if !self.group(*gid).is_identity() {
                continue;
            }
            self.reslot_identity_members(*gid, &change_map)?;
        }

        // 3. unmapped entries re-key their stored identities
        for gid in &affected {
            self.unmapped.rekey_identities(*gid, &change_map);
        }

        // 4. children merged under identity-matched dominating nodes
        // re-resolve
        for gid in &affected {
            if self.group(*gid).is_identity() {
                continue;
            }
            self.rehome_dominated_children(*gid, &change_map)?;
        }

        Ok(())
    }

    /// Propagate a target-side identification change: every non-terminal
    /// table at the affected paths re-keys.
    pub fn update_target_identities(
        &mut self,
        _identification: IdentificationId,
        changes: &[(ElementId, Identity)],
    ) -> Result<(), EngineError> {
        sink::record(MetricsEvent::IdentityUpdate);

        for (target, new) in changes {
            self.rekey_target_identity(*target, *new);
        }

        Ok(())
    }

    fn rekey_target_identity(&mut self, target: ElementId, new: Identity) {
        let mut store = self.target.borrow_mut();
        let Some(el) = store.element(target) else {
            return;
        };
        let (old, path) = (el.identity, el.path_id);
        if old == new {
            return;
        }

        if let Some(el) = store.element_mut(target) {
            el.identity = new;
        }
        let node = store.path_node_mut(path);
        if node.non_terminals.ids(old).contains(&target) {
            node.non_terminals.rekey(old, new, target);
        }
        if node.operators.ids(old).contains(&target) {
            node.operators.rekey(old, new, target);
        }
    }

    /// Move identity-group members whose identity changed into their new
    /// slots, merging and unmerging identity nodes as slots fill and drain.
    fn reslot_identity_members(
        &mut self,
        gid: GroupId,
        changes: &HashMap<ElementId, Identity>,
    ) -> Result<(), EngineError> {
        let members: Vec<ElementId> = self
            .group(gid)
            .id_members
            .keys()
            .copied()
            .filter(|member| changes.contains_key(member))
            .collect();
        if members.is_empty() {
            return Ok(());
        }

        let target_path = self.group(gid).target_path();
        let source_rc = self.source_of(gid);
        let source = source_rc.borrow();

        for member in members {
            let Some(old_slot) = self.group(gid).id_members.get(&member).copied() else {
                continue;
            };
            let new_identity = changes[&member];
            if old_slot.0 == new_identity {
                continue;
            }

            // leave the old slot: one reference off the old identity node
            let Some(old_node) = self.group(gid).id_node_table.get(&old_slot).copied() else {
                continue;
            };
            let dominating = {
                let target = self.target.borrow();
                target.element(old_node).and_then(|el| el.parent_id)
            };

            if let Some(contributors) = self.merged_by.get_mut(&old_node) {
                if let Some(position) = contributors
                    .iter()
                    .position(|(g, src)| *g == gid && *src == member)
                {
                    contributors.remove(position);
                }
                if contributors.is_empty() {
                    self.merged_by.remove(&old_node);
                }
            }
            let removed = self.target.borrow_mut().remove_element(old_node)?;
            if !removed.is_empty() {
                let group = self.group_mut(gid);
                group.id_node_table.remove(&old_slot);
                group.forget_target(old_node);
                self.cleanup_removed_targets(&removed, old_node);
            }
            {
                let group = self.group_mut(gid);
                group.id_members.remove(&member);
                group.targets.retain(|(src, _), _| *src != member);
            }

            // enter the new slot; merge_identity_node records the new slot
            // bookkeeping
            self.merge_identity_node(gid, &source, member, dominating, target_path)?;
        }

        Ok(())
    }

    /// Children whose dominating target was found by identity matching may
    /// belong under a different dominating node now.
    fn rehome_dominated_children(
        &mut self,
        gid: GroupId,
        changes: &HashMap<ElementId, Identity>,
    ) -> Result<(), EngineError> {
        // only minimal groups resolve their dominating nodes by identity
        let target_path = self.group(gid).target_path();
        if target_path.is_root() || self.group(gid).desc.prefix_group.is_some() {
            return Ok(());
        }

        let source_rc = self.source_of(gid);
        let source = source_rc.borrow();

        let mapped: Vec<(ElementId, Option<ElementId>, ElementId)> = self
            .group(gid)
            .targets
            .iter()
            .map(|((s, dom), t)| (*s, *dom, *t))
            .collect();

        for (s, old_dominating, target) in mapped {
            let Some(parent_source) = source.entry(s).and_then(|e| e.parent_id) else {
                continue;
            };
            if !changes.contains_key(&parent_source) {
                continue;
            }

            let new_dominating = self
                .resolve_min_dominating(gid, &source, s)
                .unwrap_or(None);
            if new_dominating == old_dominating {
                continue;
            }

            // re-home: preserve the contribution multiplicity across the
            // unmerge/remerge
            let refs = {
                let store = self.target.borrow();
                store.element(target).map_or(0, |el| el.ref_count)
            };
            if refs == 0 {
                continue;
            }

            let removed = self.target.borrow_mut().force_remove(target)?;
            self.merged_by.remove(&target);
            self.group_mut(gid).forget_target(target);
            self.cleanup_removed_targets(&removed, target);

            let Some(new_dominating) = new_dominating else {
                continue;
            };
            if let MergeOutcome::Mapped {
                target: new_target,
                fresh,
            } = self.merge_node(gid, &source, s, Some(new_dominating), target_path, false)?
            {
                for _ in 1..refs {
                    self.target.borrow_mut().add_element_ref(new_target)?;
                    self.merged_by.entry(new_target).or_default().push((gid, s));
                }
                if fresh {
                    if self.group(gid).is_max() {
                        self.merge_children(gid, &source, s, new_target, false)?;
                    }
                    self.merge_explicit_children(gid, &source, s, new_target)?;
                }
            }
        }

        Ok(())
    }
}
