//! Module: store
//! Responsibility: hierarchical data model: interned paths, data elements,
//! per-path node tables, identification overlays, sub-tree monitors.
//! Does not own: query-calculation or merge policy.
//! Boundary: query/merge depend on store; store depends on nothing above it.

mod element;
mod ids;
mod node;
mod path;
mod source;
mod tree;

pub use element::{DataElement, ElementTable};
pub use ids::{ElementId, GroupId, IdentificationId, Identity, IndexerId, PathId};
pub use node::{IdentityTable, NodeEntry, NodeKind, NodeValue, OperatorKind, PathNode};
pub use path::{PathAllocator, PathError};
pub use source::{ElementEntry, SourceIndexer};
pub use tree::{StoreError, TreeStore};
