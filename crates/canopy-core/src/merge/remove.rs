//! Module: merge::remove
//! Responsibility: the removal pipeline: chain dereferencing, target
//! destruction from the added sub-tree's leaves upward, and promotion of
//! the highest-priority unmapped nodes.
//! Symmetric inverse of merge::add.

use std::collections::BTreeSet;

use crate::{
    error::EngineError,
    obs::sink::{self, ExecKind, MetricsEvent, Span},
    query::{ProjId, ResultId},
    prelude::SourceIndexer,
    store::{ElementId, GroupId, PathId},
};

use super::{MergeError, MergeIndexer, add::MergeOutcome};

impl MergeIndexer {
    /// Withdraw a batch of projection matches for `(result, proj)` from the
    /// target store.
    pub fn remove_proj_matches(
        &mut self,
        ids: &[ElementId],
        result: ResultId,
        proj: ProjId,
    ) -> Result<(), EngineError> {
        let mut span = Span::new(ExecKind::MergeRemove);
        span.set_elements(ids.len() as u64);

        let Some(&max_gid) = self.max_group_by_mapping.get(&(result, proj)) else {
            return Err(MergeError::UnknownMapping { result, proj }.into());
        };
        let chain = self.chain_of(max_gid);
        let source_rc = self.source_of(max_gid);

        let mut vacated_slots: BTreeSet<(Option<ElementId>, PathId)> = BTreeSet::new();

        {
            let source = source_rc.borrow();
            for id in ids {
                // maximal level first, then each chain level that drops to
                // zero references
                self.release_source_contribution(max_gid, *id, &mut vacated_slots)?;

                let mut node = *id;
                for gid in chain.iter().skip(1) {
                    let group_source_path = self.group(*gid).source_path();
                    node = Self::raise_to_path(&source, node, group_source_path)?;
                    if self.group_mut(*gid).remove_source_ref(node) {
                        self.release_source_contribution(*gid, node, &mut vacated_slots)?;
                    }
                }
            }
        }

        // dominating nodes that lost their last child re-fill from the
        // unmapped table
        for (dominating, path) in vacated_slots {
            self.promote_at(dominating, path)?;
        }

        Ok(())
    }

    /// Withdraw one contribution of `(group, source)`: dereference the
    /// merged target (or the unmapped-table entry) and record slots whose
    /// last mapped child disappeared.
    fn release_source_contribution(
        &mut self,
        gid: GroupId,
        s: ElementId,
        vacated_slots: &mut BTreeSet<(Option<ElementId>, PathId)>,
    ) -> Result<(), EngineError> {
        let Some(target) = self.group(gid).target_of(s) else {
            // shelved: drop one counted contribution from the unmapped table
            if let Some((dominating, path)) = self.group(gid).shelved.get(&s).copied() {
                let priority = self.group(gid).priority();
                self.unmapped.remove(dominating, path, priority, gid, s, 1);
                let still_there = self
                    .unmapped
                    .at_slot(dominating, path)
                    .iter()
                    .any(|(_, g, src, _)| *g == gid && *src == s);
                if !still_there {
                    self.group_mut(gid).shelved.remove(&s);
                }
            }
            return Ok(());
        };

        // drop one (gid, s) occurrence from the reverse table
        if let Some(contributors) = self.merged_by.get_mut(&target) {
            if let Some(position) = contributors.iter().position(|(g, src)| *g == gid && *src == s)
            {
                contributors.remove(position);
            }
            if contributors.is_empty() {
                self.merged_by.remove(&target);
            }
        }

        // capture the slot before the element can be destroyed
        let slot = {
            let store = self.target.borrow();
            store
                .element(target)
                .map(|el| (el.parent_id, el.path_id))
        };

        let removed = self.target.borrow_mut().remove_element(target)?;
        if removed.is_empty() {
            // the target survives on other contributions; drop this source's
            // mapping once its own last contribution is gone
            let has_more = self
                .merged_by
                .get(&target)
                .is_some_and(|c| c.iter().any(|(g, src)| *g == gid && *src == s));
            if !has_more {
                let group = self.group_mut(gid);
                group.targets.retain(|(src, _), _| *src != s);
                group.id_members.remove(&s);
            }
            return Ok(());
        }

        // the target was destroyed together with its dominated sub-tree
        if self.group(gid).is_identity() {
            let group = self.group_mut(gid);
            if let Some(slot_key) = group.id_members.remove(&s) {
                let gone = group
                    .id_node_table
                    .get(&slot_key)
                    .is_some_and(|t| *t == target);
                if gone && !group.id_members.values().any(|other| *other == slot_key) {
                    group.id_node_table.remove(&slot_key);
                }
            }
        }

        self.group_mut(gid).forget_target(target);
        self.cleanup_removed_targets(&removed, target);

        sink::record(MetricsEvent::NodesUnmapped {
            group: gid.to_string(),
            count: 1,
        });

        if let Some((dominating, path)) = slot {
            let now_empty = self
                .target
                .borrow()
                .direct_child_elements(dominating, path)
                .is_empty();
            if now_empty {
                vacated_slots.insert((dominating, path));
            }

            // a structurally-created dominating node (an operator raised
            // for its operands) dies with its last child
            self.sweep_structural_parent(dominating);
        }

        Ok(())
    }

    /// Remove structurally-materialized ancestors that lost every child,
    /// walking upward until a directly-added node or a populated node.
    fn sweep_structural_parent(&mut self, start: Option<ElementId>) {
        let mut current = start;

        while let Some(id) = current {
            if !self.structural.contains(&id) {
                return;
            }
            let has_children = !self.target.borrow().direct_children_all(id).is_empty();
            if has_children {
                return;
            }

            let parent = {
                let store = self.target.borrow();
                store.element(id).and_then(|el| el.parent_id)
            };
            let Ok(removed) = self.target.borrow_mut().force_remove(id) else {
                return;
            };
            let contributors = self.merged_by.remove(&id).unwrap_or_default();
            for (g, _) in contributors {
                if self.groups.contains_key(&g) {
                    self.group_mut(g).forget_target(id);
                }
            }
            self.cleanup_removed_targets(&removed, id);
            self.structural.remove(&id);

            current = parent;
        }
    }

    /// Promote the highest-priority unmapped nodes at a slot whose mapped
    /// children disappeared.
    pub(crate) fn promote_at(
        &mut self,
        dominating: Option<ElementId>,
        path: PathId,
    ) -> Result<(), EngineError> {
        // the dominating node itself may have died with the removal
        if let Some(dominating_id) = dominating
            && self.target.borrow().element(dominating_id).is_none()
        {
            return Ok(());
        }
        if !self
            .target
            .borrow()
            .direct_child_elements(dominating, path)
            .is_empty()
        {
            return Ok(());
        }

        let Some((_, entries)) = self.unmapped.take_highest(dominating, path) else {
            return Ok(());
        };

        for (gid, src, count) in entries {
            self.group_mut(gid).shelved.remove(&src);

            let source_rc = self.source_of(gid);
            let source = source_rc.borrow();

            let outcome = if self.group(gid).is_identity() {
                self.merge_identity_node(gid, &source, src, dominating, path)?
            } else {
                self.merge_node(gid, &source, src, dominating, path, false)?
            };

            if let MergeOutcome::Mapped { target, fresh } = outcome {
                sink::record(MetricsEvent::Promotions {
                    group: gid.to_string(),
                    count: 1,
                });
                // restore the contribution multiplicity carried while
                // shelved
                for _ in 1..count {
                    self.target.borrow_mut().add_element_ref(target)?;
                    self.merged_by.entry(target).or_default().push((gid, src));
                }
                if fresh {
                    if self.group(gid).is_max() {
                        self.merge_children(gid, &source, src, target, false)?;
                    }
                    self.merge_explicit_children(gid, &source, src, target)?;
                }
            }
        }

        Ok(())
    }
}
