//! Shared unit-test fixtures: stores wired onto one allocator and small
//! tree builders.

use std::{cell::RefCell, rc::Rc};

use crate::store::{
    ElementId, IndexerId, NodeEntry, NodeValue, PathAllocator, PathId, StoreError, TreeStore,
};

pub(crate) fn alloc() -> Rc<RefCell<PathAllocator>> {
    Rc::new(RefCell::new(PathAllocator::new()))
}

pub(crate) fn store(alloc: &Rc<RefCell<PathAllocator>>, id: u32) -> TreeStore {
    TreeStore::new(IndexerId(id), Rc::clone(alloc))
}

pub(crate) fn shared_store(alloc: &Rc<RefCell<PathAllocator>>, id: u32) -> Rc<RefCell<TreeStore>> {
    Rc::new(RefCell::new(store(alloc, id)))
}

/// One root element carrying integer leaves at single-attribute paths:
/// `row(&mut store, &[("a", 1), ("b", 2)])`.
pub(crate) fn row(
    store: &mut TreeStore,
    leaves: &[(&str, i64)],
) -> Result<(ElementId, Vec<ElementId>), StoreError> {
    let root = store.insert_at(None, &[], NodeEntry::attributes())?;
    let mut ids = Vec::with_capacity(leaves.len());

    for (attr, value) in leaves {
        ids.push(store.insert_at(
            Some(root),
            &[attr],
            NodeEntry::terminal(NodeValue::Int(*value)),
        )?);
    }

    Ok((root, ids))
}

pub(crate) fn path(alloc: &Rc<RefCell<PathAllocator>>, attrs: &[&str]) -> PathId {
    alloc
        .borrow_mut()
        .allocate_from(None, attrs)
        .unwrap_or_else(|err| panic!("path not interned: {attrs:?} ({err:?})"))
}
