use std::collections::BTreeMap;

use crate::store::PathId;

///
/// MatchPointTable
///
/// Per-node table of path ids that carry data elements and are a prefix of
/// (or equal to) the path of some sub-query. The count is the number of
/// sub-queries for which this holds; the root entry always carries the
/// maximal count.
///

#[derive(Clone, Debug, Default)]
pub(crate) struct MatchPointTable(BTreeMap<PathId, u32>);

impl MatchPointTable {
    /// Register one sub-query on a path; returns the new count.
    pub(crate) fn add(&mut self, path_id: PathId) -> u32 {
        let count = self.0.entry(path_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Deregister one sub-query from a path; returns the remaining count.
    /// Removing an absent match point is a programming error.
    pub(crate) fn remove(&mut self, path_id: PathId) -> u32 {
        let Some(count) = self.0.get_mut(&path_id) else {
            panic!("match point removal for absent path: {path_id}");
        };
        assert!(*count > 0, "match point count below zero: {path_id}");

        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.0.remove(&path_id);
        }

        remaining
    }

    #[must_use]
    pub(crate) fn count(&self, path_id: PathId) -> u32 {
        self.0.get(&path_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub(crate) fn contains(&self, path_id: PathId) -> bool {
        self.0.contains_key(&path_id)
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (PathId, u32)> + '_ {
        self.0.iter().map(|(path, count)| (*path, *count))
    }

    /// Paths whose count equals `full` (the maximal-count match points).
    pub(crate) fn full_count_paths(&self, full: u32) -> Vec<PathId> {
        self.0
            .iter()
            .filter(|(_, count)| **count == full)
            .map(|(path, _)| *path)
            .collect()
    }

    /// Whether any match point sits below the maximal count.
    #[must_use]
    pub(crate) fn any_below(&self, full: u32) -> bool {
        self.0.values().any(|count| *count < full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_sub_query() {
        let mut table = MatchPointTable::default();
        assert_eq!(table.add(PathId::ROOT), 1);
        assert_eq!(table.add(PathId::ROOT), 2);
        assert_eq!(table.count(PathId::ROOT), 2);

        assert_eq!(table.remove(PathId::ROOT), 1);
        assert_eq!(table.remove(PathId::ROOT), 0);
        assert!(!table.contains(PathId::ROOT));
    }

    #[test]
    #[should_panic(expected = "match point removal for absent path")]
    fn removing_absent_match_point_aborts() {
        let mut table = MatchPointTable::default();
        table.remove(PathId(3));
    }

    #[test]
    fn full_count_paths_selects_maximal_entries() {
        let mut table = MatchPointTable::default();
        table.add(PathId::ROOT);
        table.add(PathId::ROOT);
        table.add(PathId(1));

        assert_eq!(table.full_count_paths(2), vec![PathId::ROOT]);
        assert!(table.any_below(2));
    }
}
