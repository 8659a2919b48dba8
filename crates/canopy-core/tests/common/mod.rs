#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use canopy_core::store::{IndexerId, PathAllocator, PathId, TreeStore};

pub fn alloc() -> Rc<RefCell<PathAllocator>> {
    Rc::new(RefCell::new(PathAllocator::new()))
}

pub fn store(alloc: &Rc<RefCell<PathAllocator>>, id: u32) -> TreeStore {
    TreeStore::new(IndexerId(id), Rc::clone(alloc))
}

pub fn shared_store(alloc: &Rc<RefCell<PathAllocator>>, id: u32) -> Rc<RefCell<TreeStore>> {
    Rc::new(RefCell::new(store(alloc, id)))
}

/// Intern a root-anchored path, keeping one reference for the test's
/// lifetime so the id stays stable even before any store uses it.
pub fn path(alloc: &Rc<RefCell<PathAllocator>>, attrs: &[&str]) -> PathId {
    alloc
        .borrow_mut()
        .allocate_from(None, attrs)
        .expect("path allocation")
}
