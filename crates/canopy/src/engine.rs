//! Module: engine
//! Responsibility: the application-facing handle: one source store, its
//! query graph, and any number of merge targets, wired so store mutations
//! flow through queries into merged targets in one call.
//! Boundary: all cross-component routing lives here; the core crates never
//! call each other directly.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use canopy_core::{
    merge::{MappingSpec, MergeIndexer},
    query::{
        DeltaKind, NodeId, ProjId, QueryGraph, ResultDelta, ResultId, ValuePredicate,
    },
    store::{
        ElementId, IdentificationId, Identity, IndexerId, NodeEntry, PathAllocator, PathId,
        SourceIndexer, TreeStore,
    },
};

use crate::Error;

///
/// TargetId
///
/// Engine-local handle of one merge target.
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TargetId(pub u32);

///
/// Engine
///
/// Owns the path allocator, the source store, one query graph over it, and
/// the merge targets consuming result streams. Single-threaded; every
/// operation completes synchronously before returning.
///

pub struct Engine {
    alloc: Rc<RefCell<PathAllocator>>,
    source: Rc<RefCell<TreeStore>>,
    graph: QueryGraph,
    targets: HashMap<TargetId, MergeIndexer>,
    /// Result streams routed into merge targets.
    routes: HashMap<(ResultId, ProjId), Vec<TargetId>>,
    next_target: u32,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        let alloc = Rc::new(RefCell::new(PathAllocator::new()));
        let source = Rc::new(RefCell::new(TreeStore::new(
            IndexerId(0),
            Rc::clone(&alloc),
        )));

        Self {
            alloc,
            source,
            graph: QueryGraph::new(),
            targets: HashMap::new(),
            routes: HashMap::new(),
            next_target: 1,
        }
    }

    #[must_use]
    pub fn source(&self) -> Rc<RefCell<TreeStore>> {
        Rc::clone(&self.source)
    }

    #[must_use]
    pub const fn graph(&self) -> &QueryGraph {
        &self.graph
    }

    /// Intern (or resolve) a root-anchored path. The engine keeps the
    /// reference, so returned ids stay valid for its lifetime.
    pub fn path(&self, attrs: &[&str]) -> Result<PathId, Error> {
        let id = self
            .alloc
            .borrow_mut()
            .allocate_from(None, attrs)
            .map_err(canopy_core::error::EngineError::from)?;
        Ok(id)
    }

    // ---- store mutation ----

    /// Insert an element and propagate through registered queries and
    /// merge targets before returning.
    pub fn insert(
        &mut self,
        parent: Option<ElementId>,
        attrs: &[&str],
        entry: NodeEntry,
    ) -> Result<ElementId, Error> {
        let id = self.source.borrow_mut().insert_at(parent, attrs, entry)?;
        let path = self
            .source
            .borrow()
            .entry(id)
            .map_or(PathId::ROOT, |e| e.path_id);

        {
            let store = self.source.borrow();
            self.graph.apply_store_delta(&*store, &[(path, id)], &[]);
        }
        self.pump()?;

        Ok(id)
    }

    /// Remove an element (and its dominated sub-tree), propagating before
    /// the store state is destroyed.
    pub fn remove(&mut self, id: ElementId) -> Result<(), Error> {
        let doomed = self.source.borrow().subtree(id);
        {
            let store = self.source.borrow();
            self.graph.apply_store_delta(&*store, &[], &doomed);
        }
        self.source.borrow_mut().remove_element(id)?;

        // paths emptied by the removal deactivate only once the store state
        // is gone
        {
            let store = self.source.borrow();
            let paths: Vec<PathId> = doomed.iter().map(|(path, _)| *path).collect();
            self.graph.reconcile_path_activity(&*store, paths);
        }
        self.pump()?;

        Ok(())
    }

    /// Apply identity changes under an identification and propagate them to
    /// every merge target.
    pub fn update_identities(
        &mut self,
        identification: IdentificationId,
        changes: &[(ElementId, Identity)],
    ) -> Result<(), Error> {
        self.source
            .borrow_mut()
            .set_identities(identification, changes);

        for target in self.targets.values_mut() {
            target.update_source_identities(identification, changes)?;
        }
        self.pump()?;

        Ok(())
    }

    // ---- query wiring ----

    pub fn add_intersection(&mut self) -> NodeId {
        self.graph.add_intersection()
    }

    pub fn add_terminal(
        &mut self,
        path: PathId,
        predicate: ValuePredicate,
        is_projection: bool,
    ) -> NodeId {
        self.graph.add_terminal(path, predicate, is_projection)
    }

    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.graph.attach(parent, child);
    }

    /// Refresh the query under `root` (builds it on first call).
    pub fn refresh(&mut self, root: NodeId) -> Result<(), Error> {
        {
            let store = self.source.borrow();
            self.graph.refresh_query(root, &*store)?;
        }
        self.pump()?;

        Ok(())
    }

    pub fn register_result(&mut self, root: NodeId) -> ResultId {
        self.graph.register_result(root)
    }

    #[must_use]
    pub fn matches(&self, node: NodeId) -> Vec<ElementId> {
        let store = self.source.borrow();
        self.graph.matches_vec(node, &*store)
    }

    #[must_use]
    pub fn proj_matches(&self, node: NodeId, result: ResultId) -> Vec<ElementId> {
        self.graph.proj_matches(node, result)
    }

    // ---- merge wiring ----

    /// Create an empty merge target.
    pub fn add_merge_target(&mut self) -> TargetId {
        let id = TargetId(self.next_target);
        self.next_target += 1;

        let store = Rc::new(RefCell::new(TreeStore::new(
            IndexerId(id.0),
            Rc::clone(&self.alloc),
        )));
        self.targets.insert(id, MergeIndexer::new(store));

        id
    }

    pub fn target(&self, id: TargetId) -> Result<&MergeIndexer, Error> {
        self.targets.get(&id).ok_or(Error::UnknownTarget(id.0))
    }

    pub fn target_mut(&mut self, id: TargetId) -> Result<&mut MergeIndexer, Error> {
        self.targets.get_mut(&id).ok_or(Error::UnknownTarget(id.0))
    }

    /// Register a mapping on a target and route the `(result, proj)` stream
    /// into it; the stream's current matches seed the target immediately.
    pub fn add_mapping(
        &mut self,
        target: TargetId,
        result: ResultId,
        proj: ProjId,
        spec: &MappingSpec,
    ) -> Result<(), Error> {
        let source = Rc::clone(&self.source);
        let seed = self.current_stream(result, proj);

        {
            let indexer = self
                .targets
                .get_mut(&target)
                .ok_or(Error::UnknownTarget(target.0))?;
            indexer.add_mapping(result, proj, &source, spec)?;
            if !seed.is_empty() {
                indexer.add_proj_matches(&seed, result, proj)?;
            }
        }

        self.routes.entry((result, proj)).or_default().push(target);
        Ok(())
    }

    /// Remove a mapping and its route.
    pub fn remove_mapping(
        &mut self,
        target: TargetId,
        result: ResultId,
        proj: Option<ProjId>,
    ) -> Result<(), Error> {
        {
            let indexer = self
                .targets
                .get_mut(&target)
                .ok_or(Error::UnknownTarget(target.0))?;
            indexer.remove_mapping(result, proj)?;
        }

        self.routes.retain(|(r, p), targets| {
            if *r == result && proj.is_none_or(|wanted| *p == wanted) {
                targets.retain(|t| *t != target);
            }
            !targets.is_empty()
        });

        Ok(())
    }

    /// Drain pending result deltas and dispatch them to routed targets.
    pub fn pump(&mut self) -> Result<(), Error> {
        loop {
            let deltas: Vec<ResultDelta> = self.graph.take_deltas();
            if deltas.is_empty() {
                return Ok(());
            }

            for delta in deltas {
                let Some(targets) = self.routes.get(&(delta.result, delta.proj)) else {
                    continue;
                };
                for target in targets.clone() {
                    let indexer = self
                        .targets
                        .get_mut(&target)
                        .ok_or(Error::UnknownTarget(target.0))?;
                    match delta.kind {
                        DeltaKind::Add => {
                            indexer.add_proj_matches(&delta.elements, delta.result, delta.proj)?;
                        }
                        DeltaKind::Remove => {
                            indexer.remove_proj_matches(
                                &delta.elements,
                                delta.result,
                                delta.proj,
                            )?;
                        }
                    }
                }
            }
        }
    }

    /// The current elements of one result stream.
    fn current_stream(&self, result: ResultId, proj: ProjId) -> Vec<ElementId> {
        let store = self.source.borrow();
        self.graph.proj_site_matches(result, proj, &*store)
    }
}
