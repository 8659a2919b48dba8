//! Module: store::path
//! Responsibility: attribute-path interning, reference counts, and prefix
//! arithmetic.
//! Does not own: element placement or per-path node tables.
//! Boundary: every store and query-calc layer resolves paths through here.

use crate::error::{EngineError, ErrorClass, ErrorOrigin};
use std::collections::HashMap;
use thiserror::Error as ThisError;

use super::PathId;

///
/// PathError
///

#[derive(Debug, ThisError)]
pub enum PathError {
    #[error("unknown path id: {0}")]
    UnknownPath(PathId),

    #[error("path {path} does not extend {prefix}")]
    NotAPrefix { prefix: PathId, path: PathId },
}

impl PathError {
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownPath(_) => ErrorClass::NotFound,
            Self::NotAPrefix { .. } => ErrorClass::Conflict,
        }
    }
}

impl From<PathError> for EngineError {
    fn from(err: PathError) -> Self {
        Self::new(err.class(), ErrorOrigin::Path, err.to_string())
    }
}

///
/// PathEntry
///

#[derive(Debug)]
struct PathEntry {
    parent: Option<PathId>,
    // attribute leading from the parent; None only for the root
    attr: Option<String>,
    children: HashMap<String, PathId>,
    ref_count: u32,
    depth: u16,
}

///
/// PathAllocator
///
/// Interns ordered attribute sequences into integer path ids. Distinct
/// sequences receive distinct ids; a child entry keeps its parent alive
/// structurally, so release only collapses chains with no children left.
///
/// The root path is preallocated and pinned.
///

#[derive(Debug)]
pub struct PathAllocator {
    entries: Vec<Option<PathEntry>>,
    free: Vec<u32>,
}

impl Default for PathAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PathAllocator {
    #[must_use]
    pub fn new() -> Self {
        let root = PathEntry {
            parent: None,
            attr: None,
            children: HashMap::new(),
            ref_count: 1,
            depth: 0,
        };

        Self {
            entries: vec![Some(root)],
            free: Vec::new(),
        }
    }

    #[must_use]
    pub const fn root(&self) -> PathId {
        PathId::ROOT
    }

    /// Allocate (or resolve) the path extending `prefix` by `attrs`, taking
    /// one reference on the result.
    pub fn allocate_from(
        &mut self,
        prefix: Option<PathId>,
        attrs: &[&str],
    ) -> Result<PathId, PathError> {
        let mut current = prefix.unwrap_or(PathId::ROOT);
        self.entry(current)?;

        for attr in attrs {
            current = self.child(current, attr);
        }

        self.entry_mut(current)?.ref_count += 1;
        Ok(current)
    }

    /// Allocate the concatenation of `prefix` and the full attribute chain of
    /// `suffix`, taking one reference on the result.
    pub fn concat(&mut self, prefix: PathId, suffix: PathId) -> Result<PathId, PathError> {
        let attrs = self.attrs(suffix)?;
        let borrowed: Vec<&str> = attrs.iter().map(String::as_str).collect();

        self.allocate_from(Some(prefix), &borrowed)
    }

    /// Take an additional reference on an existing path id.
    pub fn retain(&mut self, id: PathId) -> Result<(), PathError> {
        self.entry_mut(id)?.ref_count += 1;
        Ok(())
    }

    /// Drop one reference. Entries with no references and no children are
    /// collapsed, cascading into parents that were only held structurally.
    pub fn release(&mut self, id: PathId) -> Result<(), PathError> {
        if id.is_root() {
            return Ok(());
        }

        let entry = self.entry_mut(id)?;
        assert!(entry.ref_count > 0, "path id released below zero: {id}");
        entry.ref_count -= 1;

        self.collapse(id);
        Ok(())
    }

    /// Parent path id, or `None` for the root.
    pub fn prefix(&self, id: PathId) -> Result<Option<PathId>, PathError> {
        Ok(self.entry(id)?.parent)
    }

    /// Number of attributes from the root.
    pub fn depth(&self, id: PathId) -> Result<u16, PathError> {
        Ok(self.entry(id)?.depth)
    }

    /// Full attribute chain, root first.
    pub fn attrs(&self, id: PathId) -> Result<Vec<String>, PathError> {
        let mut out = Vec::new();
        let mut current = id;

        loop {
            let entry = self.entry(current)?;
            match (&entry.attr, entry.parent) {
                (Some(attr), Some(parent)) => {
                    out.push(attr.clone());
                    current = parent;
                }
                _ => break,
            }
        }

        out.reverse();
        Ok(out)
    }

    /// Attribute chain leading from `prefix` to `path`.
    pub fn suffix(&self, path: PathId, prefix: PathId) -> Result<Vec<String>, PathError> {
        self.diff(path, prefix)
            .ok_or(PathError::NotAPrefix { prefix, path })
    }

    /// Attribute chain from `shorter` to `longer`, or `None` when `shorter`
    /// is not a prefix of `longer`. Equal paths yield the empty chain.
    #[must_use]
    pub fn diff(&self, longer: PathId, shorter: PathId) -> Option<Vec<String>> {
        let mut out = Vec::new();
        let mut current = longer;

        while current != shorter {
            let entry = self.entries.get(current.0 as usize)?.as_ref()?;
            out.push(entry.attr.clone()?);
            current = entry.parent?;
        }

        out.reverse();
        Some(out)
    }

    /// Whether `prefix` is a (non-strict) prefix of `path`.
    #[must_use]
    pub fn is_prefix(&self, prefix: PathId, path: PathId) -> bool {
        let mut current = path;

        loop {
            if current == prefix {
                return true;
            }
            let Some(Some(entry)) = self.entries.get(current.0 as usize) else {
                return false;
            };
            let Some(parent) = entry.parent else {
                return false;
            };
            current = parent;
        }
    }

    /// Prefix chain of `id`, root first, `id` last.
    pub fn prefix_chain(&self, id: PathId) -> Result<Vec<PathId>, PathError> {
        let mut out = vec![id];
        let mut current = id;

        while let Some(parent) = self.entry(current)?.parent {
            out.push(parent);
            current = parent;
        }

        out.reverse();
        Ok(out)
    }

    /// Resolve a child path without allocating a reference (lookup only).
    #[must_use]
    pub fn lookup(&self, prefix: PathId, attrs: &[&str]) -> Option<PathId> {
        let mut current = prefix;

        for attr in attrs {
            let entry = self.entries.get(current.0 as usize)?.as_ref()?;
            current = *entry.children.get(*attr)?;
        }

        Some(current)
    }

    fn child(&mut self, parent: PathId, attr: &str) -> PathId {
        if let Some(Some(entry)) = self.entries.get(parent.0 as usize)
            && let Some(child) = entry.children.get(attr)
        {
            return *child;
        }

        let depth = self.entries[parent.0 as usize]
            .as_ref()
            .map_or(0, |e| e.depth)
            + 1;

        let id = match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(PathEntry {
                    parent: Some(parent),
                    attr: Some(attr.to_string()),
                    children: HashMap::new(),
                    ref_count: 0,
                    depth,
                });
                PathId(slot)
            }
            None => {
                let slot = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
                self.entries.push(Some(PathEntry {
                    parent: Some(parent),
                    attr: Some(attr.to_string()),
                    children: HashMap::new(),
                    ref_count: 0,
                    depth,
                }));
                PathId(slot)
            }
        };

        if let Some(Some(entry)) = self.entries.get_mut(parent.0 as usize) {
            entry.children.insert(attr.to_string(), id);
        }

        id
    }

    fn collapse(&mut self, id: PathId) {
        let mut current = id;

        loop {
            if current.is_root() {
                return;
            }
            let Some(Some(entry)) = self.entries.get(current.0 as usize) else {
                return;
            };
            if entry.ref_count > 0 || !entry.children.is_empty() {
                return;
            }

            let parent = entry.parent;
            let attr = entry.attr.clone();

            self.entries[current.0 as usize] = None;
            self.free.push(current.0);

            let Some(parent) = parent else { return };
            if let (Some(Some(parent_entry)), Some(attr)) =
                (self.entries.get_mut(parent.0 as usize), attr)
            {
                parent_entry.children.remove(&attr);
            }

            current = parent;
        }
    }

    fn entry(&self, id: PathId) -> Result<&PathEntry, PathError> {
        self.entries
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(PathError::UnknownPath(id))
    }

    fn entry_mut(&mut self, id: PathId) -> Result<&mut PathEntry, PathError> {
        self.entries
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(PathError::UnknownPath(id))
    }
}
