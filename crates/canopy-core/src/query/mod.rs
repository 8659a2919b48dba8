//! Module: query
//! Responsibility: incremental query calculation: terminal leaves, the
//! intersection node with raising and lowering, refresh orchestration,
//! result streams.
//! Does not own: store mutation or merge policy.
//! Boundary: reads the source store through `SourceIndexer` only.

mod graph;
mod intersection;
mod match_points;
mod node;
mod project;
mod propagate;
mod refresh;
mod suspend;

pub use graph::{DeltaKind, QueryGraph, ResultDelta};
pub use node::{NodeId, ProjId, ResultId, ValuePredicate};
pub use refresh::QueryError;

pub(crate) use intersection::{
    IntersectionNode, MatchMode, RaisedEntry, RefreshScratch, RemovedSub,
};
pub(crate) use match_points::MatchPointTable;
pub(crate) use node::{QueryNode, TerminalNode};
