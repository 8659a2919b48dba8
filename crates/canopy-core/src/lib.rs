//! Core runtime for Canopy: the hierarchical store, path interning, query
//! calculation nodes, refresh orchestration, and the merge indexer.
#![warn(unreachable_pub)]

pub mod error;
pub mod merge;
pub mod obs;
pub mod query;
pub mod store;

// test
#[cfg(test)]
pub(crate) mod test_support;

///
/// CONSTANTS
///

/// Maximum number of (target, source) path pairs in a single mapping vector.
///
/// This bounds the depth of merge-group chains and keeps the per-addition
/// chain traversal a small fixed cost.
pub const MAX_MAPPING_PAIRS: usize = 8;

///
/// Prelude
///
/// Prelude contains only domain vocabulary.
/// No errors, controllers, stores, or helpers are re-exported here.
///

pub mod prelude {
    pub use crate::{
        merge::{MergeIndexer, Priority},
        query::{NodeId, ProjId, QueryGraph, ResultId},
        store::{
            DataElement, ElementId, Identity, IndexerId, NodeEntry, NodeKind, NodeValue,
            OperatorKind, PathAllocator, PathId, SourceIndexer, TreeStore,
        },
    };
}
