//! Module: merge::add
//! Responsibility: the addition pipeline: chain traversal, dominating
//! resolution, priority conflicts, identity merging, operator raising, and
//! extension recursion.
//! Does not own: registration (indexer) or the removal inverse (remove).

use crate::{
    error::EngineError,
    obs::sink::{self, ExecKind, MetricsEvent, Span},
    query::{ProjId, ResultId},
    store::{
        ElementId, GroupId, Identity, NodeEntry, PathId, SourceIndexer, TreeStore,
    },
};

use super::{MergeError, MergeIndexer};

///
/// MergeOutcome
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MergeOutcome {
    /// The node is mapped; `fresh` marks a newly materialized target (as
    /// opposed to a reference added onto an existing one).
    Mapped { target: ElementId, fresh: bool },
    /// Shelved in the unmapped table after losing a priority conflict.
    Shelved,
    /// Not mergeable right now (no dominating target resolvable).
    Skipped,
}

impl MergeIndexer {
    /// Integrate a batch of projection matches for `(result, proj)` into
    /// the target store.
    pub fn add_proj_matches(
        &mut self,
        ids: &[ElementId],
        result: ResultId,
        proj: ProjId,
    ) -> Result<(), EngineError> {
        let mut span = Span::new(ExecKind::MergeAdd);
        span.set_elements(ids.len() as u64);

        let Some(&max_gid) = self.max_group_by_mapping.get(&(result, proj)) else {
            return Err(MergeError::UnknownMapping { result, proj }.into());
        };
        let chain = self.chain_of(max_gid);
        let source_rc = self.source_of(max_gid);
        let source = source_rc.borrow();

        // per-group newly-referenced arrays, maximal first, minimal last
        let mut levels: Vec<Vec<ElementId>> = vec![Vec::new(); chain.len()];
        let min_gid = *chain.last().unwrap_or(&max_gid);
        let min_target_root = self.group(min_gid).target_path().is_root();

        for id in ids {
            levels[0].push(*id);
            let mut node = *id;
            for (level, gid) in chain.iter().enumerate().skip(1) {
                let group_source_path = self.group(*gid).source_path();
                node = Self::raise_to_path(&source, node, group_source_path)?;
                if self.group_mut(*gid).add_source_ref(node) {
                    levels[level].push(node);
                }
            }
        }

        // merge from the minimal group toward the maximal one
        for level in (0..chain.len()).rev() {
            let gid = chain[level];
            let is_min = level == chain.len() - 1;
            let is_max = level == 0;
            let target_path = self.group(gid).target_path();

            for node in levels[level].clone() {
                let dominating = if is_min {
                    if min_target_root {
                        Some(None)
                    } else {
                        self.resolve_min_dominating(gid, &source, node)
                    }
                } else {
                    // the dominating target is the target merged for the
                    // node's source ancestor at the next chain level
                    let parent_gid = chain[level + 1];
                    let parent_source_path = self.group(parent_gid).source_path();
                    let ancestor = Self::raise_to_path(&source, node, parent_source_path)?;
                    self.group(parent_gid).target_of(ancestor).map(Some)
                };

                let Some(dominating) = dominating else {
                    // ancestor shelved or unresolvable: the sub-tree waits
                    // for promotion or back-fill
                    continue;
                };

                let outcome = if self.group(gid).is_identity() {
                    self.merge_identity_node(gid, &source, node, dominating, target_path)?
                } else {
                    self.merge_node(gid, &source, node, dominating, target_path, false)?
                };

                if is_max
                    && let MergeOutcome::Mapped { target, fresh: true } = outcome
                {
                    self.merge_children(gid, &source, node, target, false)?;
                }
            }
        }

        Ok(())
    }

    /// Dominating target for a minimal-group node: the source parent's
    /// identity resolved through the non-terminals at the target prefix.
    ///
    /// Same-path parents (operators) are stepped over; operator raising in
    /// `merge_node` handles those. With no dominating parent, or nothing to
    /// match against at the prefix yet, the node merges undominated.
    pub(crate) fn resolve_min_dominating(
        &self,
        gid: GroupId,
        source: &TreeStore,
        node: ElementId,
    ) -> Option<Option<ElementId>> {
        let node_path = source.entry(node)?.path_id;
        let mut parent = source.entry(node)?.parent_id;
        while let Some(candidate) = parent {
            if source.entry(candidate).map(|e| e.path_id) != Some(node_path) {
                break;
            }
            parent = source.entry(candidate).and_then(|e| e.parent_id);
        }
        let Some(parent) = parent else {
            return Some(None);
        };

        let want = self.source_identity(gid, source, parent);

        let target_path = self.group(gid).target_path();
        let target = self.target.borrow();
        let alloc = target.alloc();
        let prefix = alloc.borrow().prefix(target_path).ok()??;

        let Some(node_table) = target.path_node(prefix) else {
            return Some(None);
        };
        if node_table.non_terminals.is_empty() {
            return Some(None);
        }

        let candidates = node_table.non_terminals.ids(want);
        candidates.first().copied().map(Some)
    }

    /// Merge one source node under a dominating target at a target path.
    ///
    /// `structural` marks merges not backed by a projection add (operator
    /// raising, extension recursion, back-fill): they leave the reference
    /// count alone, and the node's first real add later claims their
    /// materialization instead of adding a reference.
    pub(crate) fn merge_node(
        &mut self,
        gid: GroupId,
        source: &TreeStore,
        s: ElementId,
        dominating: Option<ElementId>,
        target_path: PathId,
        structural: bool,
    ) -> Result<MergeOutcome, EngineError> {
        // contribution onto an already-merged node
        if let Some(target) = self.group(gid).target_under(s, dominating) {
            if structural || self.structural.remove(&target) {
                return Ok(MergeOutcome::Mapped {
                    target,
                    fresh: false,
                });
            }
            self.target.borrow_mut().add_element_ref(target)?;
            self.merged_by.entry(target).or_default().push((gid, s));
            return Ok(MergeOutcome::Mapped {
                target,
                fresh: false,
            });
        }

        let Some(entry) = source.entry(s) else {
            return Ok(MergeOutcome::Skipped);
        };

        // operator raising: an operand's parent on the same path is its
        // operator, which must merge first and becomes the dominating node
        let mut dominating = dominating;
        if let Some(parent) = entry.parent_id
            && source.entry(parent).map(|e| e.path_id) == Some(entry.path_id)
        {
            let operator_target = match self.group(gid).target_under(parent, dominating) {
                Some(existing) => Some(existing),
                None => {
                    match self.merge_node(gid, source, parent, dominating, target_path, true)? {
                        MergeOutcome::Mapped { target, .. } => Some(target),
                        MergeOutcome::Shelved | MergeOutcome::Skipped => None,
                    }
                }
            };
            match operator_target {
                Some(target) => dominating = Some(target),
                None => return Ok(MergeOutcome::Skipped),
            }
        }

        let identity = self.source_identity(gid, source, s);
        let priority = self.group(gid).priority();

        match self.mapped_priority_at(target_path, dominating) {
            Some(current) if current > priority => {
                // lower priority: merge under an operator of equal identity
                // on the same path, otherwise shelve
                if let Some(operator) = self.operator_with_identity(target_path, dominating, identity)
                {
                    self.target.borrow_mut().add_element_ref(operator)?;
                    self.group_mut(gid).record_target(s, dominating, operator);
                    self.merged_by.entry(operator).or_default().push((gid, s));
                    return Ok(MergeOutcome::Mapped {
                        target: operator,
                        fresh: false,
                    });
                }

                self.unmapped
                    .add(dominating, target_path, priority, gid, s, identity, 1);
                self.group_mut(gid).shelved.insert(s, (dominating, target_path));
                sink::record(MetricsEvent::NodesUnmapped {
                    group: gid.to_string(),
                    count: 1,
                });
                return Ok(MergeOutcome::Shelved);
            }
            Some(current) if current < priority => {
                // higher priority: displace the mapped content first
                self.force_unmap_slot(target_path, dominating)?;
            }
            Some(_) | None => {}
        }

        // equal priority (or empty slot): merge by identity into an
        // existing non-terminal before materializing a new node
        let source_entry = source
            .node_entry(s)
            .cloned()
            .unwrap_or_else(NodeEntry::attributes);
        if source_entry.is_non_terminal()
            && let Some(candidate) =
                self.non_terminal_with_identity(target_path, dominating, identity)
        {
            self.target.borrow_mut().add_element_ref(candidate)?;
            self.group_mut(gid).record_target(s, dominating, candidate);
            self.merged_by.entry(candidate).or_default().push((gid, s));
            return Ok(MergeOutcome::Mapped {
                target: candidate,
                fresh: false,
            });
        }

        let target = self.materialize(
            gid,
            s,
            dominating,
            target_path,
            identity,
            source_entry,
            structural,
        )?;
        Ok(MergeOutcome::Mapped {
            target,
            fresh: true,
        })
    }

    /// Merge one source node into an identity group: one virtual target per
    /// distinct `(identity, parent identity)` slot.
    pub(crate) fn merge_identity_node(
        &mut self,
        gid: GroupId,
        source: &TreeStore,
        s: ElementId,
        dominating: Option<ElementId>,
        target_path: PathId,
    ) -> Result<MergeOutcome, EngineError> {
        let identity = self.source_identity(gid, source, s);
        let parent_identity =
            dominating.and_then(|d| self.target.borrow().element(d).map(|el| el.identity));
        let slot = (identity, parent_identity);

        if let Some(&existing) = self.group(gid).id_node_table.get(&slot) {
            self.target.borrow_mut().add_element_ref(existing)?;
            self.merged_by.entry(existing).or_default().push((gid, s));
            let group = self.group_mut(gid);
            group.id_members.insert(s, slot);
            group.record_target(s, dominating, existing);
            return Ok(MergeOutcome::Mapped {
                target: existing,
                fresh: false,
            });
        }

        // identity nodes are always virtual: never reuse the source id
        let target = {
            let mut target = self.target.borrow_mut();
            target.insert_element_with(dominating, target_path, NodeEntry::attributes(), |el| {
                el.identity = identity;
                el.group_id = Some(gid);
                el.source_id = Some(s);
            })?
        };
        {
            let mut store = self.target.borrow_mut();
            store
                .path_node_mut(target_path)
                .non_terminals
                .add(identity, target);
        }

        let group = self.group_mut(gid);
        group.id_node_table.insert(slot, target);
        group.id_members.insert(s, slot);
        group.record_target(s, dominating, target);
        self.merged_by.entry(target).or_default().push((gid, s));

        sink::record(MetricsEvent::NodesMapped {
            group: gid.to_string(),
            count: 1,
        });

        Ok(MergeOutcome::Mapped {
            target,
            fresh: true,
        })
    }

    /// Create the target data element for a mapped source node, reusing the
    /// source id where free and not forced fresh.
    #[allow(clippy::too_many_arguments)]
    fn materialize(
        &mut self,
        gid: GroupId,
        s: ElementId,
        dominating: Option<ElementId>,
        target_path: PathId,
        identity: Identity,
        entry: NodeEntry,
        structural: bool,
    ) -> Result<ElementId, EngineError> {
        let obligatory = self.group(gid).obligatory;
        let is_operator = entry.kind.is_operator();
        let non_terminal = entry.is_non_terminal();

        let target = {
            let mut target = self.target.borrow_mut();
            let desired = ElementId(s.0);

            let id = if !obligatory && target.element(desired).is_none() {
                target.insert_with_id(desired, dominating, target_path, entry, |el| {
                    el.identity = identity;
                    el.group_id = Some(gid);
                    el.source_id = Some(s);
                })?
            } else {
                target.insert_element_with(dominating, target_path, entry, |el| {
                    el.identity = identity;
                    el.group_id = Some(gid);
                    el.source_id = Some(s);
                })?
            };

            if non_terminal {
                target.path_node_mut(target_path).non_terminals.add(identity, id);
            }
            if is_operator {
                target.path_node_mut(target_path).operators.add(identity, id);
            }

            id
        };

        self.group_mut(gid).record_target(s, dominating, target);
        self.merged_by.entry(target).or_default().push((gid, s));
        if structural {
            self.structural.insert(target);
        }

        sink::record(MetricsEvent::NodesMapped {
            group: gid.to_string(),
            count: 1,
        });

        Ok(target)
    }

    /// Displace every mapped child at a slot into the unmapped table and
    /// destroy its target sub-tree.
    pub(crate) fn force_unmap_slot(
        &mut self,
        target_path: PathId,
        dominating: Option<ElementId>,
    ) -> Result<(), EngineError> {
        let children = self
            .target
            .borrow()
            .direct_child_elements(dominating, target_path);

        for child in children {
            let identity = self
                .target
                .borrow()
                .element(child)
                .map_or(Identity(0), |el| el.identity);

            let contributors = self.merged_by.remove(&child).unwrap_or_default();
            for (g, src) in &contributors {
                let priority = self.group(*g).priority();
                self.unmapped
                    .add(dominating, target_path, priority, *g, *src, identity, 1);
                self.group_mut(*g).shelved.insert(*src, (dominating, target_path));
                self.group_mut(*g).forget_target(child);
            }

            sink::record(MetricsEvent::NodesUnmapped {
                group: contributors
                    .first()
                    .map_or_else(String::new, |(g, _)| g.to_string()),
                count: contributors.len() as u64,
            });

            let removed = self.target.borrow_mut().force_remove(child)?;
            self.cleanup_removed_targets(&removed, child);
        }

        Ok(())
    }

    /// Unhook bookkeeping for destroyed target elements (the root of the
    /// destroyed sub-tree is handled by the caller).
    pub(crate) fn cleanup_removed_targets(
        &mut self,
        removed: &[(PathId, ElementId)],
        already_handled: ElementId,
    ) {
        for (_, target) in removed {
            self.structural.remove(target);
            self.monitors.remove(target);
            if *target == already_handled {
                continue;
            }
            let contributors = self.merged_by.remove(target).unwrap_or_default();
            for (g, _) in contributors {
                if self.groups.contains_key(&g) {
                    self.group_mut(g).forget_target(*target);
                }
            }
        }
    }

    /// Recursively merge the source children of a freshly-mapped node:
    /// same-path operands unconditionally, extension paths when traced or
    /// monitored (or when `force` pulls a monitored sub-tree).
    pub(crate) fn merge_children(
        &mut self,
        gid: GroupId,
        source: &TreeStore,
        s: ElementId,
        target: ElementId,
        force: bool,
    ) -> Result<(), EngineError> {
        if self.identity_only_groups.contains(&gid) {
            return Ok(());
        }

        let Some(source_path) = source.entry(s).map(|e| e.path_id) else {
            return Ok(());
        };
        let target_path = {
            let store = self.target.borrow();
            let Some(el) = store.element(target) else {
                return Ok(());
            };
            el.path_id
        };

        for (child_path, child) in source.direct_children_all(s) {
            if self.group(gid).target_under(child, Some(target)).is_some() {
                continue;
            }

            if child_path == source_path {
                // operand under an operator: same path, always part of the
                // node's content
                if let MergeOutcome::Mapped {
                    target: child_target,
                    fresh: true,
                } = self.merge_node(gid, source, child, Some(target), target_path, true)?
                {
                    self.merge_children(gid, source, child, child_target, force)?;
                }
                continue;
            }

            let target_child_path = {
                let store = self.target.borrow();
                let alloc = store.alloc();
                let Some(suffix) = alloc.borrow().diff(child_path, source_path) else {
                    continue;
                };
                let borrowed: Vec<&str> = suffix.iter().map(String::as_str).collect();
                let path = alloc
                    .borrow_mut()
                    .allocate_from(Some(target_path), &borrowed)
                    .map_err(EngineError::from)?;
                let _ = alloc.borrow_mut().release(path);
                path
            };

            if self.non_extension_paths.contains(&target_child_path) {
                continue;
            }

            let active = force
                || self.target.borrow().is_traced(target_child_path)
                || self.target.borrow().is_monitored(target);
            if !active {
                continue;
            }

            if let MergeOutcome::Mapped {
                target: child_target,
                fresh: true,
            } = self.merge_node(gid, source, child, Some(target), target_child_path, true)?
            {
                self.merge_children(gid, source, child, child_target, force)?;
            }
        }

        Ok(())
    }

    /// Re-merge explicit chain levels below a re-mapped node (promotion and
    /// identity re-homing): child groups re-attach their still-referenced
    /// source nodes.
    pub(crate) fn merge_explicit_children(
        &mut self,
        gid: GroupId,
        source: &TreeStore,
        s: ElementId,
        target: ElementId,
    ) -> Result<(), EngineError> {
        let child_groups: Vec<GroupId> = self
            .groups
            .values()
            .filter(|g| g.desc.prefix_group == Some(gid))
            .map(|g| g.id)
            .collect();

        let parent_source_path = self.group(gid).source_path();

        for child_gid in child_groups {
            let child_target_path = self.group(child_gid).target_path();
            let pending: Vec<ElementId> = self
                .group(child_gid)
                .source_nodes
                .keys()
                .copied()
                .filter(|node| {
                    Self::raise_to_path(source, *node, parent_source_path)
                        .is_ok_and(|ancestor| ancestor == s)
                })
                .collect();

            for node in pending {
                if self.group(child_gid).target_under(node, Some(target)).is_some() {
                    continue;
                }
                if let MergeOutcome::Mapped {
                    target: child_target,
                    fresh: true,
                } = self.merge_node(child_gid, source, node, Some(target), child_target_path, false)?
                {
                    if self.group(child_gid).is_max() {
                        self.merge_children(child_gid, source, node, child_target, false)?;
                    }
                    self.merge_explicit_children(child_gid, source, node, child_target)?;
                }
            }
        }

        Ok(())
    }

    // ---- identity-table lookups ----

    fn non_terminal_with_identity(
        &self,
        target_path: PathId,
        dominating: Option<ElementId>,
        identity: Identity,
    ) -> Option<ElementId> {
        let target = self.target.borrow();
        let node = target.path_node(target_path)?;

        node.non_terminals
            .ids(identity)
            .into_iter()
            .find(|id| target.element(*id).is_some_and(|el| el.parent_id == dominating))
    }

    fn operator_with_identity(
        &self,
        target_path: PathId,
        dominating: Option<ElementId>,
        identity: Identity,
    ) -> Option<ElementId> {
        let target = self.target.borrow();
        let node = target.path_node(target_path)?;

        node.operators
            .ids(identity)
            .into_iter()
            .find(|id| target.element(*id).is_some_and(|el| el.parent_id == dominating))
    }
}
