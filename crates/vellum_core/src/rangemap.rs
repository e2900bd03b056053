//! Ordered map from key ranges to values.
//!
//! The map always covers the whole keyspace: it is a sorted set of boundary
//! keys, each owning the half-open range up to the next boundary (the last
//! entry runs to the end of keyspace). Mutating a sub-range first splits the
//! boundaries so no entry straddles the edit.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::keys::all_keys;
use crate::types::{Key, KeyRange};

#[derive(Clone, Debug)]
pub struct RangeMap<V> {
    entries: BTreeMap<Key, V>,
}

impl<V: Clone> RangeMap<V> {
    /// A map where the entire keyspace carries `initial`.
    pub fn new(initial: V) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Vec::new(), initial);
        Self { entries }
    }

    /// Number of distinct ranges.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn end_of(&self, begin: &[u8]) -> Key {
        self.entries
            .range::<[u8], _>((Bound::Excluded(begin), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| all_keys().end)
    }

    /// The range containing `key` and its value.
    pub fn range_containing(&self, key: &[u8]) -> (KeyRange, &V) {
        let (begin, value) = self
            .entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .expect("range map always covers the empty key");
        (KeyRange::new(begin.clone(), self.end_of(begin)), value)
    }

    /// The range containing the largest key strictly before `key`.
    pub fn range_containing_key_before(&self, key: &[u8]) -> (KeyRange, &V) {
        let (begin, value) = self
            .entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .unwrap_or_else(|| self.entries.iter().next().expect("non-empty map"));
        (KeyRange::new(begin.clone(), self.end_of(begin)), value)
    }

    /// All ranges overlapping `range`, in key order.
    pub fn intersecting_ranges(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let first_begin = self
            .entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(range.begin.as_slice())))
            .next_back()
            .map(|(k, _)| k.clone())
            .expect("range map always covers the empty key");
        for (begin, value) in self
            .entries
            .range::<[u8], _>((Bound::Included(first_begin.as_slice()), Bound::Unbounded))
        {
            if begin.as_slice() >= range.end.as_slice() {
                break;
            }
            out.push((KeyRange::new(begin.clone(), self.end_of(begin)), value));
        }
        out
    }

    /// All ranges in key order.
    pub fn ranges(&self) -> Vec<(KeyRange, &V)> {
        self.intersecting_ranges(&all_keys())
    }

    /// Split the map at `key` so a boundary exists there.
    fn split_at(&mut self, key: &[u8]) {
        if key.is_empty() || key >= all_keys().end.as_slice() {
            return;
        }
        if self.entries.contains_key(key) {
            return;
        }
        let (_, value) = self.range_containing(key);
        let value = value.clone();
        self.entries.insert(key.to_vec(), value);
    }

    /// Apply `f` to every entry overlapping `range`, splitting boundaries so
    /// the edit is exact.
    pub fn modify(&mut self, range: &KeyRange, mut f: impl FnMut(&KeyRange, &mut V)) {
        if range.is_empty() {
            return;
        }
        self.split_at(&range.begin);
        self.split_at(&range.end);
        let begins: Vec<Key> = self
            .entries
            .range::<[u8], _>((
                Bound::Included(range.begin.as_slice()),
                Bound::Excluded(range.end.as_slice()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for begin in begins {
            let end = self.end_of(&begin);
            let value = self.entries.get_mut(&begin).expect("entry just listed");
            f(&KeyRange::new(begin, end), value);
        }
    }

    /// Replace everything in `range` with a single entry carrying `value`.
    pub fn insert(&mut self, range: &KeyRange, value: V) {
        if range.is_empty() {
            return;
        }
        self.split_at(&range.begin);
        self.split_at(&range.end);
        let inner: Vec<Key> = self
            .entries
            .range::<[u8], _>((
                Bound::Excluded(range.begin.as_slice()),
                Bound::Excluded(range.end.as_slice()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in inner {
            self.entries.remove(&key);
        }
        self.entries.insert(range.begin.clone(), value);
    }
}

impl<V: Clone + PartialEq> RangeMap<V> {
    /// Merge adjacent ranges within `range` whose values compare equal.
    pub fn coalesce(&mut self, range: &KeyRange) {
        let candidates: Vec<Key> = self
            .entries
            .range::<[u8], _>((
                Bound::Included(range.begin.as_slice()),
                Bound::Excluded(range.end.as_slice()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in candidates {
            if key.is_empty() {
                continue;
            }
            let prev_value = self
                .entries
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_slice())))
                .next_back()
                .map(|(_, v)| v.clone());
            if prev_value.as_ref() == self.entries.get(&key) {
                self.entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(ranges: &[(&[u8], i32)]) -> RangeMap<i32> {
        let mut map = RangeMap::new(0);
        for window in ranges.windows(2) {
            map.insert(
                &KeyRange::new(window[0].0.to_vec(), window[1].0.to_vec()),
                window[0].1,
            );
        }
        if let Some((begin, value)) = ranges.last() {
            map.insert(&KeyRange::new(begin.to_vec(), all_keys().end), *value);
        }
        map
    }

    #[test]
    fn containing_lookups() {
        let map = map_of(&[(b"", 1), (b"d", 2), (b"m", 3)]);
        assert_eq!(*map.range_containing(b"a").1, 1);
        assert_eq!(*map.range_containing(b"d").1, 2);
        assert_eq!(*map.range_containing(b"z").1, 3);
        let (range, _) = map.range_containing(b"f");
        assert_eq!(range, KeyRange::new(b"d".to_vec(), b"m".to_vec()));
    }

    #[test]
    fn containing_key_before_steps_past_boundary() {
        let map = map_of(&[(b"", 1), (b"d", 2)]);
        // "d" is the first key of the second range, so the key before it
        // falls in the first.
        assert_eq!(*map.range_containing_key_before(b"d").1, 1);
        assert_eq!(*map.range_containing_key_before(b"e").1, 2);
    }

    #[test]
    fn intersecting_ranges_clips_to_query() {
        let map = map_of(&[(b"", 1), (b"d", 2), (b"m", 3)]);
        let hits = map.intersecting_ranges(&KeyRange::new(b"e".to_vec(), b"n".to_vec()));
        assert_eq!(hits.len(), 2);
        assert_eq!(*hits[0].1, 2);
        assert_eq!(*hits[1].1, 3);
    }

    #[test]
    fn modify_splits_boundaries() {
        let mut map = RangeMap::new(0);
        map.modify(&KeyRange::new(b"b".to_vec(), b"f".to_vec()), |_, v| *v += 5);
        assert_eq!(*map.range_containing(b"a").1, 0);
        assert_eq!(*map.range_containing(b"c").1, 5);
        assert_eq!(*map.range_containing(b"f").1, 0);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn insert_replaces_covered_entries() {
        let mut map = map_of(&[(b"", 1), (b"d", 2), (b"m", 3)]);
        map.insert(&KeyRange::new(b"b".to_vec(), b"p".to_vec()), 9);
        assert_eq!(*map.range_containing(b"c").1, 9);
        assert_eq!(*map.range_containing(b"o").1, 9);
        assert_eq!(*map.range_containing(b"q").1, 3);
        assert_eq!(*map.range_containing(b"a").1, 1);
    }

    #[test]
    fn coalesce_merges_equal_neighbors() {
        let mut map = RangeMap::new(0);
        map.insert(&KeyRange::new(b"b".to_vec(), b"d".to_vec()), 1);
        map.insert(&KeyRange::new(b"d".to_vec(), b"f".to_vec()), 1);
        assert_eq!(map.len(), 4);
        map.coalesce(&all_keys());
        assert_eq!(map.len(), 3);
        assert_eq!(*map.range_containing(b"e").1, 1);
    }
}
