//! Storage snapshots: a serializable view of one store's path nodes for
//! diagnostics and test plumbing. Read-only; never consulted by engine
//! logic.

use serde::{Deserialize, Serialize};

use crate::store::{SourceIndexer, TreeStore};

///
/// StorageReport
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StorageReport {
    pub indexer_id: u32,
    pub element_count: usize,
    pub paths: Vec<PathReport>,
}

///
/// PathReport
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PathReport {
    pub path_id: u32,
    pub attrs: String,
    pub element_count: usize,
    pub traced: bool,
    pub monitor_count: u32,
    pub non_terminal_identities: usize,
    pub operator_identities: usize,
}

/// Snapshot one store.
#[must_use]
pub fn storage_report(store: &TreeStore) -> StorageReport {
    let alloc = store.alloc();
    let alloc = alloc.borrow();

    let mut paths: Vec<PathReport> = store
        .path_nodes()
        .map(|node| PathReport {
            path_id: node.path_id.0,
            attrs: alloc
                .attrs(node.path_id)
                .map(|attrs| attrs.join("."))
                .unwrap_or_default(),
            element_count: node.nodes.len(),
            traced: node.traced,
            monitor_count: node.monitor_count,
            non_terminal_identities: node.non_terminals.len(),
            operator_identities: node.operators.len(),
        })
        .collect();
    paths.sort_by_key(|report| report.path_id);

    StorageReport {
        indexer_id: store.indexer_id().0,
        element_count: store.element_count(),
        paths,
    }
}
