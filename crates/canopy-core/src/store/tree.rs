//! Module: store::tree
//! Responsibility: element placement, per-path node tables, identification
//! overlays, and sub-tree monitor counts for one store instance.
//! Does not own: path interning policy (allocator) or merge semantics.
//! Boundary: query and merge layers read through `SourceIndexer`.

use crate::error::{EngineError, ErrorClass, ErrorOrigin};
use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap},
    rc::Rc,
};
use thiserror::Error as ThisError;

use super::{
    DataElement, ElementEntry, ElementId, ElementTable, IdentificationId, Identity, IndexerId,
    NodeEntry, NodeKind, PathAllocator, PathId, PathNode, SourceIndexer,
};

///
/// StoreError
///

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("element not found: {0}")]
    ElementNotFound(ElementId),

    #[error("dominating element not found: {0}")]
    ParentNotFound(ElementId),

    #[error("unknown path id: {0}")]
    UnknownPath(PathId),
}

impl StoreError {
    pub(crate) const fn class(&self) -> ErrorClass {
        ErrorClass::NotFound
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::new(err.class(), ErrorOrigin::Store, err.to_string())
    }
}

///
/// TreeStore
///
/// One tree-structured store: data elements at interned paths, each with a
/// dominating parent. Serves as the source store for query graphs and as the
/// target store inside a merge indexer.
///

pub struct TreeStore {
    indexer_id: IndexerId,
    alloc: Rc<RefCell<PathAllocator>>,
    elements: ElementTable,
    path_nodes: HashMap<PathId, PathNode>,
    identifications: HashMap<IdentificationId, HashMap<ElementId, Identity>>,
    monitors: HashMap<ElementId, u32>,
    upstream: BTreeSet<IndexerId>,
    next_element: u32,
}

impl TreeStore {
    #[must_use]
    pub fn new(indexer_id: IndexerId, alloc: Rc<RefCell<PathAllocator>>) -> Self {
        Self {
            indexer_id,
            alloc,
            elements: ElementTable::new(),
            path_nodes: HashMap::new(),
            identifications: HashMap::new(),
            monitors: HashMap::new(),
            upstream: BTreeSet::new(),
            next_element: 0,
        }
    }

    #[must_use]
    pub fn alloc(&self) -> Rc<RefCell<PathAllocator>> {
        Rc::clone(&self.alloc)
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn path_node(&self, path_id: PathId) -> Option<&PathNode> {
        self.path_nodes.get(&path_id)
    }

    /// Iterate all live path nodes (diagnostics only).
    pub fn path_nodes(&self) -> impl Iterator<Item = &PathNode> {
        self.path_nodes.values()
    }

    pub(crate) fn path_node_mut(&mut self, path_id: PathId) -> &mut PathNode {
        self.path_nodes
            .entry(path_id)
            .or_insert_with(|| PathNode::new(path_id))
    }

    pub(crate) fn record_upstream(&mut self, ids: impl IntoIterator<Item = IndexerId>) {
        self.upstream.extend(ids);
    }

    /// Place a new element at `path_id` under `parent`, with an explicit
    /// element record setup closure applied before insertion.
    pub fn insert_element(
        &mut self,
        parent: Option<ElementId>,
        path_id: PathId,
        entry: NodeEntry,
    ) -> Result<ElementId, StoreError> {
        self.insert_element_with(parent, path_id, entry, |_| {})
    }

    pub fn insert_element_with(
        &mut self,
        parent: Option<ElementId>,
        path_id: PathId,
        entry: NodeEntry,
        setup: impl FnOnce(&mut DataElement),
    ) -> Result<ElementId, StoreError> {
        if let Some(parent_id) = parent
            && !self.elements.contains_key(&parent_id)
        {
            return Err(StoreError::ParentNotFound(parent_id));
        }

        let id = ElementId(self.next_element);
        self.next_element += 1;

        let mut element = DataElement::new(id, path_id, parent);
        if entry.kind == NodeKind::Terminal {
            element.identity = Identity::of_bytes(&entry.value.identity_bytes());
        }
        setup(&mut element);

        if !self.path_nodes.contains_key(&path_id) {
            // the store holds one path reference per live path node
            let _ = self.alloc.borrow_mut().retain(path_id);
            self.path_nodes.insert(path_id, PathNode::new(path_id));
        }
        self.path_node_mut(path_id).insert(id, parent, entry);
        self.elements.insert(id, element);

        Ok(id)
    }

    /// Place a new element under an explicit id (merge targets mirror their
    /// source ids where free). The id must not be live.
    pub fn insert_with_id(
        &mut self,
        id: ElementId,
        parent: Option<ElementId>,
        path_id: PathId,
        entry: NodeEntry,
        setup: impl FnOnce(&mut DataElement),
    ) -> Result<ElementId, StoreError> {
        assert!(
            !self.elements.contains_key(&id),
            "explicit element id already live: {id}"
        );
        if let Some(parent_id) = parent
            && !self.elements.contains_key(&parent_id)
        {
            return Err(StoreError::ParentNotFound(parent_id));
        }

        if self.next_element <= id.0 {
            self.next_element = id.0 + 1;
        }

        let mut element = DataElement::new(id, path_id, parent);
        if entry.kind == NodeKind::Terminal {
            element.identity = Identity::of_bytes(&entry.value.identity_bytes());
        }
        setup(&mut element);

        if !self.path_nodes.contains_key(&path_id) {
            let _ = self.alloc.borrow_mut().retain(path_id);
            self.path_nodes.insert(path_id, PathNode::new(path_id));
        }
        self.path_node_mut(path_id).insert(id, parent, entry);
        self.elements.insert(id, element);

        Ok(id)
    }

    /// Destroy an element and its dominated sub-tree regardless of its
    /// reference count (forced unmapping and tracing flushes).
    pub fn force_remove(
        &mut self,
        id: ElementId,
    ) -> Result<Vec<(PathId, ElementId)>, StoreError> {
        if !self.elements.contains_key(&id) {
            return Err(StoreError::ElementNotFound(id));
        }

        let mut removed = Vec::new();
        self.destroy(id, &mut removed);
        removed.reverse();

        Ok(removed)
    }

    /// Place a new element on the path extending the parent's path by
    /// `attrs` (the parent's own path for an empty chain).
    pub fn insert_at(
        &mut self,
        parent: Option<ElementId>,
        attrs: &[&str],
        entry: NodeEntry,
    ) -> Result<ElementId, StoreError> {
        let base = match parent {
            Some(id) => {
                self.elements
                    .get(&id)
                    .ok_or(StoreError::ParentNotFound(id))?
                    .path_id
            }
            None => PathId::ROOT,
        };

        let path_id = self
            .alloc
            .borrow_mut()
            .allocate_from(Some(base), attrs)
            .map_err(|_| StoreError::UnknownPath(base))?;
        // insert_element pins the path through its path node; drop the
        // allocation reference taken above
        let id = self.insert_element(parent, path_id, entry)?;
        let _ = self.alloc.borrow_mut().release(path_id);

        Ok(id)
    }

    pub fn add_element_ref(&mut self, id: ElementId) -> Result<u32, StoreError> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or(StoreError::ElementNotFound(id))?;
        element.ref_count += 1;

        Ok(element.ref_count)
    }

    /// Drop one reference from an element. When the count reaches zero the
    /// element and its dominated sub-tree are destroyed; all destroyed
    /// `(path, id)` pairs are returned, leaves first.
    pub fn remove_element(
        &mut self,
        id: ElementId,
    ) -> Result<Vec<(PathId, ElementId)>, StoreError> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or(StoreError::ElementNotFound(id))?;
        assert!(element.ref_count > 0, "element ref count below zero: {id}");

        element.ref_count -= 1;
        if element.ref_count > 0 {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        self.destroy(id, &mut removed);
        removed.reverse();

        Ok(removed)
    }

    /// Direct children of an element across every path, as `(path, id)`
    /// pairs.
    #[must_use]
    pub fn direct_children_all(&self, id: ElementId) -> Vec<(PathId, ElementId)> {
        let mut out: Vec<(PathId, ElementId)> = self
            .path_nodes
            .values()
            .flat_map(|node| {
                node.children_of(Some(id))
                    .into_iter()
                    .map(move |child| (node.path_id, child))
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// The dominated sub-tree of `id` (self included) as `(path, id)` pairs,
    /// dominating elements first. Used to stage removal notifications while
    /// entries are still readable.
    #[must_use]
    pub fn subtree(&self, id: ElementId) -> Vec<(PathId, ElementId)> {
        let mut out = Vec::new();
        let mut queue = vec![id];

        while let Some(current) = queue.pop() {
            let Some(element) = self.elements.get(&current) else {
                continue;
            };
            out.push((element.path_id, current));

            for node in self.path_nodes.values() {
                queue.extend(node.children_of(Some(current)));
            }
        }

        out
    }

    fn destroy(&mut self, id: ElementId, removed: &mut Vec<(PathId, ElementId)>) {
        let Some(element) = self.elements.remove(&id) else {
            return;
        };

        removed.push((element.path_id, id));

        let children: Vec<(PathId, ElementId)> = self
            .path_nodes
            .values()
            .flat_map(|node| {
                node.children_of(Some(id))
                    .into_iter()
                    .map(move |child| (node.path_id, child))
            })
            .collect();

        if let Some(node) = self.path_nodes.get_mut(&element.path_id) {
            node.non_terminals.remove(element.identity, id);
            node.operators.remove(element.identity, id);
            node.remove(id, element.parent_id);
        }
        self.monitors.remove(&id);
        for table in self.identifications.values_mut() {
            table.remove(&id);
        }

        for (_, child) in children {
            self.destroy(child, removed);
        }

        self.maybe_remove_path_node(element.path_id);
    }

    pub(crate) fn maybe_remove_path_node(&mut self, path_id: PathId) {
        let removable = self
            .path_nodes
            .get(&path_id)
            .is_some_and(PathNode::is_removable);

        if removable {
            self.path_nodes.remove(&path_id);
            let _ = self.alloc.borrow_mut().release(path_id);
        }
    }

    #[must_use]
    pub fn element(&self, id: ElementId) -> Option<&DataElement> {
        self.elements.get(&id)
    }

    pub(crate) fn element_mut(&mut self, id: ElementId) -> Option<&mut DataElement> {
        self.elements.get_mut(&id)
    }

    /// Override the base identity of an element.
    pub fn set_base_identity(&mut self, id: ElementId, identity: Identity) -> Result<(), StoreError> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or(StoreError::ElementNotFound(id))?;
        element.identity = identity;

        Ok(())
    }

    /// Set identities under an identification overlay; returns the previous
    /// effective identity per element.
    pub fn set_identities(
        &mut self,
        identification: IdentificationId,
        changes: &[(ElementId, Identity)],
    ) -> Vec<(ElementId, Identity)> {
        let mut previous = Vec::with_capacity(changes.len());

        for (id, identity) in changes {
            let old = self.identity(Some(identification), *id);
            previous.push((*id, old));
            self.identifications
                .entry(identification)
                .or_default()
                .insert(*id, *identity);
        }

        previous
    }

    pub fn set_trace(&mut self, path_id: PathId, traced: bool) {
        if traced {
            if !self.path_nodes.contains_key(&path_id) {
                let _ = self.alloc.borrow_mut().retain(path_id);
                self.path_nodes.insert(path_id, PathNode::new(path_id));
            }
            self.path_node_mut(path_id).traced = true;
        } else if let Some(node) = self.path_nodes.get_mut(&path_id) {
            node.traced = false;
            self.maybe_remove_path_node(path_id);
        }
    }

    #[must_use]
    pub fn is_traced(&self, path_id: PathId) -> bool {
        self.path_nodes.get(&path_id).is_some_and(|node| node.traced)
    }

    pub fn register_subtree_monitor(&mut self, id: ElementId) -> Result<(), StoreError> {
        let element = self
            .elements
            .get(&id)
            .ok_or(StoreError::ElementNotFound(id))?;
        let path_id = element.path_id;

        *self.monitors.entry(id).or_insert(0) += 1;
        self.path_node_mut(path_id).monitor_count += 1;

        Ok(())
    }

    pub fn release_subtree_monitor(&mut self, id: ElementId) -> Result<(), StoreError> {
        let count = self
            .monitors
            .get_mut(&id)
            .ok_or(StoreError::ElementNotFound(id))?;
        assert!(*count > 0, "monitor count below zero: {id}");

        *count -= 1;
        if *count == 0 {
            self.monitors.remove(&id);
        }

        if let Some(element) = self.elements.get(&id) {
            let path_id = element.path_id;
            if let Some(node) = self.path_nodes.get_mut(&path_id) {
                node.monitor_count = node.monitor_count.saturating_sub(1);
            }
            self.maybe_remove_path_node(path_id);
        }

        Ok(())
    }

    /// Same-path descent closure: operators dominate operands on their own
    /// path, so stepping onto a path must also collect transitive same-path
    /// children.
    fn close_same_path(&self, path_id: PathId, ids: &mut Vec<ElementId>) {
        let Some(node) = self.path_nodes.get(&path_id) else {
            return;
        };

        let mut cursor = 0;
        while cursor < ids.len() {
            let current = ids[cursor];
            cursor += 1;
            for child in node.children_of(Some(current)) {
                if !ids.contains(&child) {
                    ids.push(child);
                }
            }
        }
    }
}

impl SourceIndexer for TreeStore {
    fn indexer_id(&self) -> IndexerId {
        self.indexer_id
    }

    fn upstream_ids(&self) -> Vec<IndexerId> {
        self.upstream.iter().copied().collect()
    }

    fn entry(&self, id: ElementId) -> Option<ElementEntry> {
        self.elements.get(&id).map(|element| ElementEntry {
            path_id: element.path_id,
            parent_id: element.parent_id,
            identity: element.identity,
        })
    }

    fn node_entry(&self, id: ElementId) -> Option<&NodeEntry> {
        let element = self.elements.get(&id)?;
        self.path_nodes.get(&element.path_id)?.nodes.get(&id)
    }

    fn prefix_chain(&self, path_id: PathId) -> Vec<PathId> {
        self.alloc.borrow().prefix_chain(path_id).unwrap_or_default()
    }

    fn elements_at_path(&self, path_id: PathId) -> Vec<ElementId> {
        self.path_nodes
            .get(&path_id)
            .map(|node| node.nodes.keys().copied().collect())
            .unwrap_or_default()
    }

    fn direct_child_elements(
        &self,
        dominating: Option<ElementId>,
        child_path: PathId,
    ) -> Vec<ElementId> {
        self.path_nodes
            .get(&child_path)
            .map(|node| node.children_of(dominating))
            .unwrap_or_default()
    }

    fn dominated_nodes(
        &self,
        source_path: PathId,
        dominating: &[ElementId],
        anchor_path: PathId,
    ) -> Vec<ElementId> {
        let Some(chain) = self.alloc.borrow().diff(source_path, anchor_path) else {
            return Vec::new();
        };

        let mut frontier: Vec<ElementId> = dominating
            .iter()
            .copied()
            .filter(|id| self.elements.contains_key(id))
            .collect();
        let mut path = anchor_path;
        self.close_same_path(path, &mut frontier);

        for attr in &chain {
            let Some(next_path) = self.alloc.borrow().lookup(path, &[attr]) else {
                return Vec::new();
            };
            path = next_path;

            let Some(node) = self.path_nodes.get(&path) else {
                return Vec::new();
            };
            let mut next = Vec::new();
            for id in &frontier {
                next.extend(node.children_of(Some(*id)));
            }
            self.close_same_path(path, &mut next);
            frontier = next;
        }

        frontier.retain(|id| {
            self.elements
                .get(id)
                .is_some_and(|element| element.path_id == source_path)
        });
        frontier
    }

    fn base_identity(&self, id: ElementId) -> Identity {
        self.elements
            .get(&id)
            .map_or(Identity(0), |element| element.identity)
    }

    fn identity(&self, identification: Option<IdentificationId>, id: ElementId) -> Identity {
        identification
            .and_then(|ident| self.identifications.get(&ident))
            .and_then(|table| table.get(&id))
            .copied()
            .unwrap_or_else(|| self.base_identity(id))
    }

    fn is_monitored(&self, id: ElementId) -> bool {
        let mut current = Some(id);

        while let Some(id) = current {
            if self.monitors.get(&id).copied().unwrap_or(0) > 0 {
                return true;
            }
            current = self.elements.get(&id).and_then(|element| element.parent_id);
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeValue;

    fn store() -> TreeStore {
        TreeStore::new(IndexerId(1), Rc::new(RefCell::new(PathAllocator::new())))
    }

    #[test]
    fn insert_and_entry_round_trip() {
        let mut s = store();
        let root = s.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let child = s
            .insert_at(Some(root), &["a"], NodeEntry::terminal(NodeValue::Int(1)))
            .unwrap();

        let entry = s.entry(child).unwrap();
        assert_eq!(entry.parent_id, Some(root));
        assert!(!entry.path_id.is_root());
    }

    #[test]
    fn remove_cascades_to_dominated_subtree() {
        let mut s = store();
        let root = s.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let a = s.insert_at(Some(root), &["a"], NodeEntry::attributes()).unwrap();
        let b = s
            .insert_at(Some(a), &["b"], NodeEntry::terminal(NodeValue::Int(7)))
            .unwrap();

        let removed = s.remove_element(root).unwrap();
        let ids: Vec<ElementId> = removed.iter().map(|(_, id)| *id).collect();

        assert!(ids.contains(&root));
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
        assert_eq!(s.element_count(), 0);
    }

    #[test]
    fn ref_counted_removal_defers_destruction() {
        let mut s = store();
        let root = s.insert_at(None, &[], NodeEntry::attributes()).unwrap();

        s.add_element_ref(root).unwrap();
        assert!(s.remove_element(root).unwrap().is_empty());
        assert_eq!(s.element_count(), 1);

        assert_eq!(s.remove_element(root).unwrap().len(), 1);
        assert_eq!(s.element_count(), 0);
    }

    #[test]
    fn dominated_nodes_walks_child_paths() {
        let mut s = store();
        let r0 = s.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let r1 = s.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let a0 = s
            .insert_at(Some(r0), &["a"], NodeEntry::terminal(NodeValue::Int(1)))
            .unwrap();
        let _a1 = s
            .insert_at(Some(r1), &["a"], NodeEntry::terminal(NodeValue::Int(2)))
            .unwrap();

        let path_a = s.alloc().borrow().lookup(PathId::ROOT, &["a"]).unwrap();
        let dominated = s.dominated_nodes(path_a, &[r0], PathId::ROOT);

        assert_eq!(dominated, vec![a0]);
    }

    #[test]
    fn dominated_nodes_descends_through_operators() {
        let mut s = store();
        let root = s.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let op = s
            .insert_at(
                Some(root),
                &["x"],
                NodeEntry::operator(crate::store::OperatorKind::Negation),
            )
            .unwrap();
        let operand = s
            .insert_at(Some(op), &[], NodeEntry::terminal(NodeValue::Int(3)))
            .unwrap();

        let path_x = s.alloc().borrow().lookup(PathId::ROOT, &["x"]).unwrap();
        let dominated = s.dominated_nodes(path_x, &[root], PathId::ROOT);

        assert!(dominated.contains(&op));
        assert!(dominated.contains(&operand));
    }

    #[test]
    fn monitor_covers_descendants() {
        let mut s = store();
        let root = s.insert_at(None, &[], NodeEntry::attributes()).unwrap();
        let a = s.insert_at(Some(root), &["a"], NodeEntry::attributes()).unwrap();

        s.register_subtree_monitor(root).unwrap();
        assert!(s.is_monitored(a));

        s.release_subtree_monitor(root).unwrap();
        assert!(!s.is_monitored(a));
    }
}
