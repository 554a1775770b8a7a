use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use twox_hash::xxh3::hash128;

/// Unordered, deduplicated collection of byte strings. Grounded on
/// `examples/original_source/distributed_store/rafty/store/fsm.go`'s
/// `applyAddToSet`, with `murmur3` (unmaintained) swapped for `twox-hash`'s
/// XXH3-128 as the content-addressing hash (documented in `DESIGN.md`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodedSet {
    entries: Vec<(String, Vec<u8>)>,
}

impl EncodedSet {
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }
        rmp_serde::from_slice(bytes).unwrap_or_default()
    }

    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("EncodedSet is always serializable")
    }

    pub fn insert(&mut self, value: Vec<u8>) {
        let hash = hex::encode(hash128(&value).to_be_bytes());
        if let Some(existing) = self.entries.iter_mut().find(|(h, _)| *h == hash) {
            existing.1 = value;
        } else {
            self.entries.push((hash, value));
        }
    }

    pub fn values(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered sequence of byte strings. Grounded on `fsm.go`'s `applyLPush` /
/// `applyLRem`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodedList {
    items: Vec<Vec<u8>>,
}

impl EncodedList {
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }
        rmp_serde::from_slice(bytes).unwrap_or_default()
    }

    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("EncodedList is always serializable")
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Prepends `values` in order: each is inserted at the front in turn, so
    /// the last of `values` ends up first overall, matching the original's
    /// `insert(l, value, 0)` loop.
    pub fn lpush(&mut self, values: impl IntoIterator<Item = Vec<u8>>) {
        for value in values {
            self.items.insert(0, value);
        }
    }

    /// Removes up to `count.abs()` occurrences of `value`: left-to-right
    /// when `count >= 0`, right-to-left when `count < 0`, all occurrences
    /// when `count == 0`. `spec.md` §4.1's op table and the
    /// *LRem direction* invariant in §8 are authoritative here; the original
    /// Go `applyLRem` unconditionally drops every match regardless of
    /// `count`, which this corrects.
    pub fn lrem(&mut self, count: i64, value: &[u8]) {
        let limit = count.unsigned_abs() as usize;
        let remove_all = count == 0;
        let mut removed = 0usize;

        if count >= 0 {
            self.items.retain(|item| {
                if item == value && (remove_all || removed < limit) {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        } else {
            let mut keep = vec![true; self.items.len()];
            for i in (0..self.items.len()).rev() {
                if self.items[i] == value && removed < limit {
                    removed += 1;
                    keep[i] = false;
                }
            }
            let mut it = keep.into_iter();
            self.items.retain(|_| it.next().unwrap_or(true));
        }
    }

    /// Zero-based, negative-from-end, inclusive-of-`to` range per `spec.md`
    /// §4.2 "LRange semantics". Grounded on `store.go`'s `LRange`: `from` is
    /// only out of range when it is strictly greater than the list length
    /// (`from == len` yields an empty slice, not an error).
    pub fn range(&self, from: i64, to: i64) -> Result<Vec<Vec<u8>>, &'static str> {
        let len = self.items.len() as i64;

        let from = if from < 0 { (len + from).max(0) } else { from };
        if from > len {
            return Err("Start index larger than length of list");
        }

        let mut to = if to < 0 { len + to } else { to };
        if to >= 0 {
            to += 1;
        }
        let to = to.min(len);

        if from > to {
            return Err("Start index is after end");
        }

        Ok(self.items[from as usize..to as usize].to_vec())
    }
}

/// `(id, score, value)` triples ordered by ascending score. Grounded on
/// `spec.md` §3's sorted-set data model; `id = md5(value)` exactly as
/// specified so identical values update in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodedSortedSet {
    entries: Vec<SortedSetEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SortedSetEntry {
    id: String,
    score: f64,
    value: Vec<u8>,
}

impl EncodedSortedSet {
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }
        rmp_serde::from_slice(bytes).unwrap_or_default()
    }

    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("EncodedSortedSet is always serializable")
    }

    pub fn upsert(&mut self, score: f64, value: Vec<u8>) {
        let id = hex::encode(Md5::digest(&value));
        self.entries.retain(|e| e.id != id);
        let pos = self
            .entries
            .partition_point(|e| e.score <= score);
        self.entries.insert(pos, SortedSetEntry { id, score, value });
    }

    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|e| e.score >= min && e.score <= max)
            .map(|e| e.value.clone())
            .collect()
    }

    pub fn remove_range_by_score(&mut self, min: f64, max: f64) {
        self.entries.retain(|e| !(e.score >= min && e.score <= max));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_dedups_by_content_hash() {
        let mut set = EncodedSet::default();
        set.insert(b"a".to_vec());
        set.insert(b"a".to_vec());
        set.insert(b"b".to_vec());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn lpush_prepends_in_order() {
        let mut list = EncodedList::default();
        list.lpush(vec![b"foo".to_vec(), b"bar".to_vec(), b"baz".to_vec(), b"foo".to_vec()]);
        assert_eq!(list.len(), 4);
        assert_eq!(list.items, vec![b"foo".to_vec(), b"baz".to_vec(), b"bar".to_vec(), b"foo".to_vec()]);
    }

    #[test]
    fn lrem_direction_and_count_semantics() {
        let base = vec![b"f".to_vec(), b"f".to_vec(), b"b".to_vec(), b"f".to_vec()];

        let mut a = EncodedList { items: base.clone() };
        a.lrem(2, b"f");
        assert_eq!(a.items, vec![b"b".to_vec(), b"f".to_vec()]);

        let mut b = EncodedList { items: base.clone() };
        b.lrem(-2, b"f");
        assert_eq!(b.items, vec![b"f".to_vec(), b"b".to_vec()]);

        let mut c = EncodedList { items: base };
        c.lrem(0, b"f");
        assert_eq!(c.items, vec![b"b".to_vec()]);
    }

    #[test]
    fn lrange_scenario_from_spec() {
        let mut list = EncodedList::default();
        list.lpush(vec![b"foo".to_vec(), b"bar".to_vec(), b"baz".to_vec(), b"foo".to_vec()]);
        list.lrem(2, b"foo");
        assert_eq!(list.range(0, -1).unwrap(), vec![b"baz".to_vec(), b"bar".to_vec()]);

        list.lpush(vec![b"fee".to_vec(), b"fie".to_vec(), b"foe".to_vec(), b"fum".to_vec()]);
        assert_eq!(list.range(0, -1).unwrap().len(), 6);
        assert_eq!(list.range(0, -3).unwrap().len(), 4);
        assert_eq!(list.range(-3, -1).unwrap().len(), 3);
    }

    #[test]
    fn range_on_empty_list_is_empty_not_an_error() {
        let list = EncodedList::default();
        assert_eq!(list.range(0, -1).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn range_from_equal_to_len_is_empty_not_an_error() {
        let mut list = EncodedList::default();
        list.lpush(vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(list.range(2, -1).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn range_from_past_len_is_an_error() {
        let mut list = EncodedList::default();
        list.lpush(vec![b"a".to_vec()]);
        assert!(list.range(2, -1).is_err());
    }

    #[test]
    fn zset_range_and_remove_scenario_from_spec() {
        let mut zset = EncodedSortedSet::default();
        zset.upsert(1.0, b"foo".to_vec());
        zset.upsert(2.0, b"bar".to_vec());
        zset.upsert(3.0, b"baz".to_vec());
        zset.upsert(4.0, b"bim".to_vec());
        assert_eq!(zset.range_by_score(3.0, 5.0).len(), 2);

        zset.upsert(5.0, b"boo".to_vec());
        zset.upsert(5.0, b"borp".to_vec());
        assert_eq!(zset.range_by_score(3.0, 5.0).len(), 4);

        zset.remove_range_by_score(3.0, 5.0);
        assert_eq!(zset.range_by_score(0.0, 100.0), vec![b"foo".to_vec(), b"bar".to_vec()]);
    }
}
