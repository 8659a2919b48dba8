use std::collections::{BTreeMap, HashMap};

use crate::store::{ElementId, GroupId, Identity, PathId};

use super::Priority;

///
/// UnmappedEntry
///
/// One shelved source node: its identity at shelving time and the number of
/// projection-add contributions it carried (restored on promotion).
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct UnmappedEntry {
    pub(crate) identity: Identity,
    pub(crate) count: u32,
}

type UnmappedSlot = BTreeMap<(Priority, GroupId), HashMap<ElementId, UnmappedEntry>>;

///
/// UnmappedNodes
///
/// Source nodes that lost a priority conflict, shelved per
/// `(dominating, target path)` slot and keyed by priority, group, and
/// source identity. The highest-priority buckets are promoted when the
/// winning nodes disappear.
///

#[derive(Debug, Default)]
pub(crate) struct UnmappedNodes {
    slots: HashMap<(Option<ElementId>, PathId), UnmappedSlot>,
}

impl UnmappedNodes {
    pub(crate) fn add(
        &mut self,
        dominating: Option<ElementId>,
        target_path: PathId,
        priority: Priority,
        group: GroupId,
        source: ElementId,
        identity: Identity,
        count: u32,
    ) {
        let entry = self
            .slots
            .entry((dominating, target_path))
            .or_default()
            .entry((priority, group))
            .or_default()
            .entry(source)
            .or_insert(UnmappedEntry { identity, count: 0 });
        entry.identity = identity;
        entry.count += count;
    }

    /// Drop `count` contributions from a shelved node; the node leaves the
    /// table when its count reaches zero. Returns false when absent.
    pub(crate) fn remove(
        &mut self,
        dominating: Option<ElementId>,
        target_path: PathId,
        priority: Priority,
        group: GroupId,
        source: ElementId,
        count: u32,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&(dominating, target_path)) else {
            return false;
        };
        let Some(bucket) = slot.get_mut(&(priority, group)) else {
            return false;
        };
        let Some(entry) = bucket.get_mut(&source) else {
            return false;
        };

        entry.count = entry.count.saturating_sub(count);
        if entry.count == 0 {
            bucket.remove(&source);
        }
        if bucket.is_empty() {
            slot.remove(&(priority, group));
        }
        if slot.is_empty() {
            self.slots.remove(&(dominating, target_path));
        }

        true
    }

    /// Remove and return the highest-priority buckets at a slot. Returns the
    /// winning priority and its `(group, source, count)` triples.
    pub(crate) fn take_highest(
        &mut self,
        dominating: Option<ElementId>,
        target_path: PathId,
    ) -> Option<(Priority, Vec<(GroupId, ElementId, u32)>)> {
        let slot = self.slots.get_mut(&(dominating, target_path))?;
        let (priority, _) = *slot.keys().next_back()?;

        let mut out = Vec::new();
        // all buckets sharing the winning priority promote together
        let keys: Vec<(Priority, GroupId)> = slot
            .keys()
            .filter(|(p, _)| *p == priority)
            .copied()
            .collect();
        for key in keys {
            if let Some(bucket) = slot.remove(&key) {
                out.extend(
                    bucket
                        .into_iter()
                        .map(|(source, entry)| (key.1, source, entry.count)),
                );
            }
        }
        if slot.is_empty() {
            self.slots.remove(&(dominating, target_path));
        }

        Some((priority, out))
    }

    /// Entries at one slot, highest priority first (diagnostics and tests).
    pub(crate) fn at_slot(
        &self,
        dominating: Option<ElementId>,
        target_path: PathId,
    ) -> Vec<(Priority, GroupId, ElementId, Identity)> {
        let Some(slot) = self.slots.get(&(dominating, target_path)) else {
            return Vec::new();
        };

        slot.iter()
            .rev()
            .flat_map(|((priority, group), bucket)| {
                bucket
                    .iter()
                    .map(move |(source, entry)| (*priority, *group, *source, entry.identity))
            })
            .collect()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.slots
            .values()
            .flat_map(BTreeMap::values)
            .map(HashMap::len)
            .sum()
    }

    /// Drop every entry belonging to a group (group destruction).
    pub(crate) fn drop_group(&mut self, group: GroupId) {
        self.slots.retain(|_, slot| {
            slot.retain(|(_, g), _| *g != group);
            !slot.is_empty()
        });
    }

    /// Re-key stored source identities after an identity update.
    pub(crate) fn rekey_identities(
        &mut self,
        group: GroupId,
        changes: &HashMap<ElementId, Identity>,
    ) {
        for slot in self.slots.values_mut() {
            for ((_, g), bucket) in slot.iter_mut() {
                if *g != group {
                    continue;
                }
                for (source, entry) in bucket.iter_mut() {
                    if let Some(new) = changes.get(source) {
                        entry.identity = *new;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_bucket_promotes_first() {
        let mut table = UnmappedNodes::default();
        let path = PathId(4);

        table.add(None, path, Priority(1), GroupId(1), ElementId(10), Identity(1), 1);
        table.add(None, path, Priority(3), GroupId(2), ElementId(11), Identity(2), 2);
        table.add(None, path, Priority(2), GroupId(3), ElementId(12), Identity(3), 1);

        let (priority, promoted) = table.take_highest(None, path).unwrap();
        assert_eq!(priority, Priority(3));
        assert_eq!(promoted, vec![(GroupId(2), ElementId(11), 2)]);

        let (priority, _) = table.take_highest(None, path).unwrap();
        assert_eq!(priority, Priority(2));
    }

    #[test]
    fn counted_removal_keeps_partial_entries() {
        let mut table = UnmappedNodes::default();
        let path = PathId(9);

        table.add(None, path, Priority(1), GroupId(1), ElementId(5), Identity(7), 2);
        assert!(table.remove(None, path, Priority(1), GroupId(1), ElementId(5), 1));
        assert_eq!(table.len(), 1);

        assert!(table.remove(None, path, Priority(1), GroupId(1), ElementId(5), 1));
        assert!(table.is_empty());
        assert!(!table.remove(None, path, Priority(1), GroupId(1), ElementId(5), 1));
    }
}
