//! Module: merge::tracing
//! Responsibility: the activity surface of target paths: consumer tracing
//! with eager back-fill and flush, extension matches, and sub-tree
//! monitors.
//! Does not own: priority or identity policy (add/remove).

use crate::{
    error::EngineError,
    obs::sink::{self, MetricsEvent},
    query::{ProjId, ResultId},
    store::{ElementId, GroupId, PathId, SourceIndexer},
};

use super::{MergeError, MergeIndexer, add::MergeOutcome};

impl MergeIndexer {
    /// Activate consumer tracing on a target path. Source data that was
    /// dominated by already-merged nodes but withheld by inactivity is
    /// back-filled eagerly; nodes inside monitored sub-trees were already
    /// merged via their monitors and are skipped.
    pub fn activate_path_tracing(&mut self, path: PathId) -> Result<(), EngineError> {
        self.target.borrow_mut().set_trace(path, true);
        sink::record(MetricsEvent::PathTracing { activated: true });

        let Some(prefix) = self.path_prefix(path) else {
            return Ok(());
        };

        // every mapped node at the prefix may now expose children here
        let parents: Vec<(ElementId, GroupId, ElementId)> = {
            let target = self.target.borrow();
            let Some(node) = target.path_node(prefix) else {
                return Ok(());
            };
            node.nodes
                .keys()
                .filter_map(|id| {
                    let el = target.element(*id)?;
                    Some((*id, el.group_id?, el.source_id?))
                })
                .collect()
        };

        for (parent_target, gid, parent_source) in parents {
            if self.target.borrow().is_monitored(parent_target) {
                continue;
            }
            if !self.groups.contains_key(&gid) || self.group(gid).is_identity() {
                continue;
            }

            let source_rc = self.source_of(gid);
            let source = source_rc.borrow();

            let Some(child_source_path) =
                self.extension_source_path(&source, parent_source, prefix, path)
            else {
                continue;
            };

            let children = source.direct_child_elements(Some(parent_source), child_source_path);
            for child in children {
                if self
                    .group(gid)
                    .target_under(child, Some(parent_target))
                    .is_some()
                {
                    continue;
                }
                if let MergeOutcome::Mapped {
                    target: child_target,
                    fresh: true,
                } = self.merge_node(gid, &source, child, Some(parent_target), path, true)?
                {
                    self.merge_children(gid, &source, child, child_target, false)?;
                }
            }
        }

        Ok(())
    }

    /// Deactivate consumer tracing on a target path. Extension-mapped nodes
    /// there are flushed eagerly, except nodes inside monitored sub-trees
    /// and nodes at a group's explicit target path.
    pub fn deactivate_path_tracing(&mut self, path: PathId) -> Result<(), EngineError> {
        self.target.borrow_mut().set_trace(path, false);
        sink::record(MetricsEvent::PathTracing { activated: false });

        let explicit: Vec<GroupId> = self
            .groups
            .values()
            .filter(|group| group.desc.target_path == path)
            .map(|group| group.id)
            .collect();

        let elements: Vec<ElementId> = {
            let target = self.target.borrow();
            target
                .path_node(path)
                .map(|node| node.nodes.keys().copied().collect())
                .unwrap_or_default()
        };

        for id in elements {
            // an earlier flush in this loop may have removed the element
            // through a cascading sub-tree
            let (monitored, group_id) = {
                let target = self.target.borrow();
                let Some(el) = target.element(id) else {
                    continue;
                };
                (target.is_monitored(id), el.group_id)
            };
            if monitored {
                continue;
            }
            if group_id.is_some_and(|gid| explicit.contains(&gid)) {
                continue;
            }

            let removed = self.target.borrow_mut().force_remove(id)?;
            let contributors = self.merged_by.remove(&id).unwrap_or_default();
            for (g, _) in contributors {
                if self.groups.contains_key(&g) {
                    self.group_mut(g).forget_target(id);
                }
            }
            self.cleanup_removed_targets(&removed, id);
        }

        {
            let mut target = self.target.borrow_mut();
            target.maybe_remove_path_node(path);
        }

        Ok(())
    }

    /// Merge source elements arriving on extension paths (driven by mapping
    /// monitors on the source): each element merges under its nearest
    /// already-mapped dominating node.
    pub fn add_extension_matches(
        &mut self,
        ids: &[ElementId],
        result: ResultId,
        proj: ProjId,
    ) -> Result<(), EngineError> {
        let Some(&max_gid) = self.max_group_by_mapping.get(&(result, proj)) else {
            return Err(MergeError::UnknownMapping { result, proj }.into());
        };
        let source_rc = self.source_of(max_gid);
        let source = source_rc.borrow();

        for id in ids {
            // walk up to the nearest merged ancestor, then merge downward
            let mut pending: Vec<ElementId> = vec![*id];
            let mut anchor: Option<(ElementId, ElementId)> = None;

            let mut cursor = *id;
            while let Some(parent) = source.entry(cursor).and_then(|e| e.parent_id) {
                if let Some(target) = self.group(max_gid).target_of(parent) {
                    anchor = Some((parent, target));
                    break;
                }
                pending.push(parent);
                cursor = parent;
            }

            let Some((_, mut dominating_target)) = anchor else {
                continue;
            };

            for node in pending.into_iter().rev() {
                let Some(node_path) = source.entry(node).map(|e| e.path_id) else {
                    break;
                };
                let parent_path = {
                    let target = self.target.borrow();
                    target
                        .element(dominating_target)
                        .map(|el| el.path_id)
                        .unwrap_or(PathId::ROOT)
                };
                let source_parent_path = source
                    .entry(node)
                    .and_then(|e| e.parent_id)
                    .and_then(|p| source.entry(p))
                    .map_or(node_path, |e| e.path_id);

                let target_path = if node_path == source_parent_path {
                    parent_path
                } else {
                    let Some(path) =
                        self.extension_target_path(&source, node_path, source_parent_path, parent_path)
                    else {
                        break;
                    };
                    path
                };

                match self.merge_node(
                    max_gid,
                    &source,
                    node,
                    Some(dominating_target),
                    target_path,
                    true,
                )? {
                    MergeOutcome::Mapped { target, .. } => dominating_target = target,
                    MergeOutcome::Shelved | MergeOutcome::Skipped => break,
                }
            }
        }

        Ok(())
    }

    /// Inverse of `add_extension_matches`.
    pub fn remove_extension_matches(
        &mut self,
        ids: &[ElementId],
        result: ResultId,
        proj: ProjId,
    ) -> Result<(), EngineError> {
        let Some(&max_gid) = self.max_group_by_mapping.get(&(result, proj)) else {
            return Err(MergeError::UnknownMapping { result, proj }.into());
        };

        for id in ids {
            let Some(target) = self.group(max_gid).target_of(*id) else {
                continue;
            };

            let removed = self.target.borrow_mut().remove_element(target)?;
            if let Some(contributors) = self.merged_by.get_mut(&target) {
                if let Some(position) = contributors
                    .iter()
                    .position(|(g, src)| *g == max_gid && *src == *id)
                {
                    contributors.remove(position);
                }
                if contributors.is_empty() {
                    self.merged_by.remove(&target);
                }
            }
            if !removed.is_empty() {
                self.group_mut(max_gid).forget_target(target);
                self.cleanup_removed_targets(&removed, target);
            }
        }

        Ok(())
    }

    /// Register a consumer sub-tree monitor on a mapped target node: the
    /// full source sub-tree below it merges regardless of path tracing.
    pub fn register_subtree_monitor(&mut self, target_id: ElementId) -> Result<(), EngineError> {
        let (gid, source_id) = {
            let target = self.target.borrow();
            let el = target
                .element(target_id)
                .ok_or_else(|| EngineError::from(crate::store::StoreError::ElementNotFound(target_id)))?;
            (el.group_id, el.source_id)
        };

        self.target.borrow_mut().register_subtree_monitor(target_id)?;
        *self.monitors.entry(target_id).or_insert(0) += 1;
        sink::record(MetricsEvent::MonitorChange { registered: true });

        if let (Some(gid), Some(source_id)) = (gid, source_id)
            && self.groups.contains_key(&gid)
        {
            let source_rc = self.source_of(gid);
            let source = source_rc.borrow();
            self.merge_children(gid, &source, source_id, target_id, true)?;
        }

        Ok(())
    }

    /// Release a consumer sub-tree monitor; nodes below the target that are
    /// not otherwise traced flush eagerly.
    pub fn release_subtree_monitor(&mut self, target_id: ElementId) -> Result<(), EngineError> {
        let Some(count) = self.monitors.get_mut(&target_id) else {
            return Err(
                EngineError::from(crate::store::StoreError::ElementNotFound(target_id)),
            );
        };
        assert!(*count > 0, "monitor count below zero: {target_id}");
        *count -= 1;
        if *count == 0 {
            self.monitors.remove(&target_id);
        }

        self.target.borrow_mut().release_subtree_monitor(target_id)?;
        sink::record(MetricsEvent::MonitorChange { registered: false });

        // flush descendants at untraced extension paths
        let descendants: Vec<(PathId, ElementId)> = {
            let target = self.target.borrow();
            target
                .subtree(target_id)
                .into_iter()
                .filter(|(path, id)| *id != target_id && !target.is_traced(*path))
                .collect()
        };
        for (_, id) in descendants {
            if self.target.borrow().element(id).is_none() {
                continue;
            }
            if self.target.borrow().is_monitored(id) {
                continue;
            }
            let removed = self.target.borrow_mut().force_remove(id)?;
            let contributors = self.merged_by.remove(&id).unwrap_or_default();
            for (g, _) in contributors {
                if self.groups.contains_key(&g) {
                    self.group_mut(g).forget_target(id);
                }
            }
            self.cleanup_removed_targets(&removed, id);
        }

        Ok(())
    }

    // ---- path arithmetic helpers ----

    fn path_prefix(&self, path: PathId) -> Option<PathId> {
        let target = self.target.borrow();
        let alloc = target.alloc();
        let prefix = alloc.borrow().prefix(path).ok()?;
        prefix
    }

    /// Source-side path matching a target extension step: the source parent
    /// path extended by the attribute chain between the target prefix and
    /// the activated path.
    fn extension_source_path(
        &self,
        source: &crate::store::TreeStore,
        parent_source: ElementId,
        target_prefix: PathId,
        target_path: PathId,
    ) -> Option<PathId> {
        let target = self.target.borrow();
        let alloc = target.alloc();
        let suffix = alloc.borrow().diff(target_path, target_prefix)?;

        let source_parent_path = source.entry(parent_source)?.path_id;
        let borrowed: Vec<&str> = suffix.iter().map(String::as_str).collect();
        alloc.borrow().lookup(source_parent_path, &borrowed)
    }

    /// Target-side path matching a source extension step.
    fn extension_target_path(
        &self,
        _source: &crate::store::TreeStore,
        node_path: PathId,
        source_parent_path: PathId,
        target_parent_path: PathId,
    ) -> Option<PathId> {
        let target = self.target.borrow();
        let alloc = target.alloc();
        let suffix = alloc.borrow().diff(node_path, source_parent_path)?;
        let borrowed: Vec<&str> = suffix.iter().map(String::as_str).collect();

        let path = alloc
            .borrow_mut()
            .allocate_from(Some(target_parent_path), &borrowed)
            .ok()?;
        let _ = alloc.borrow_mut().release(path);

        if self.non_extension_paths.contains(&path) {
            return None;
        }
        Some(path)
    }
}
