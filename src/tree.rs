//! The ordered index tree and its bidirectional cursors.
//!
//! The underlying store is treated as an opaque ordered map from composite
//! index keys to key nodes. Entries are ordered by the interleaved geohash
//! word first, so a contiguous range of the map is a contiguous run of
//! cells on the space-filling curve. Queries never mutate the tree; the
//! outer lock excludes writers for the duration of a scan.

use crate::geohash::GeoHash;
use crate::spec::{IndexKey, IndexSpec};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Locator of a stored document.
pub type RecordId = u64;

/// Full ordering key of one index entry. `seq` distinguishes multiple keys
/// of the same document that land in the same cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    word: u64,
    loc: RecordId,
    seq: u32,
}

/// One index entry as seen by the query engines.
#[derive(Debug, Clone)]
pub struct KeyNode {
    pub key: IndexKey,
    pub loc: RecordId,
    pub seq: u32,
}

/// Ordered geo index over one collection.
#[derive(Debug, Default)]
pub struct GeoTree {
    entries: BTreeMap<EntryKey, KeyNode>,
}

impl GeoTree {
    pub fn new() -> Self {
        GeoTree::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index every location key of `doc` under `loc`.
    pub fn insert_document(
        &mut self,
        spec: &IndexSpec,
        loc: RecordId,
        doc: &Value,
    ) -> crate::error::Result<usize> {
        let keys = spec.get_keys(doc)?;
        let n = keys.len();
        for (seq, key) in keys.into_iter().enumerate() {
            let seq = seq as u32;
            let word = key.hash.word();
            self.entries
                .insert(EntryKey { word, loc, seq }, KeyNode { key, loc, seq });
        }
        Ok(n)
    }

    /// Remove every key `doc` contributed under `loc`. Key extraction is
    /// deterministic, so re-deriving the keys finds the same entries insert
    /// placed.
    pub fn remove_document(
        &mut self,
        spec: &IndexSpec,
        loc: RecordId,
        doc: &Value,
    ) -> crate::error::Result<usize> {
        let keys = spec.get_keys(doc)?;
        let mut removed = 0;
        for (seq, key) in keys.into_iter().enumerate() {
            let entry = EntryKey {
                word: key.hash.word(),
                loc,
                seq: seq as u32,
            };
            if self.entries.remove(&entry).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Iterate all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyNode> {
        self.entries.values()
    }

    fn first_at_or_after(&self, word: u64) -> Option<EntryKey> {
        self.entries
            .range(EntryKey { word, loc: 0, seq: 0 }..)
            .next()
            .map(|(k, _)| *k)
    }

    fn last_before(&self, word: u64) -> Option<EntryKey> {
        self.entries
            .range(..EntryKey { word, loc: 0, seq: 0 })
            .next_back()
            .map(|(k, _)| *k)
    }
}

/// A cursor into the tree that can advance in either direction.
///
/// `found` records whether the initial seek landed on an entry whose cell
/// word equals the sought hash exactly.
pub struct TreeLocation<'t> {
    tree: &'t GeoTree,
    cur: Option<EntryKey>,
    pub found: bool,
}

impl<'t> TreeLocation<'t> {
    /// Seed the descending and ascending cursors that together sweep all
    /// keys around `start`: `min` begins at the last entry below `start`'s
    /// word, `max` at the first entry at or above it. Returns `None` when
    /// the tree has no entries on either side.
    pub fn initial(tree: &'t GeoTree, start: &GeoHash) -> Option<(Self, Self)> {
        let word = start.word();
        let min_key = tree.last_before(word);
        let max_key = tree.first_at_or_after(word);
        if min_key.is_none() && max_key.is_none() {
            return None;
        }
        let found = max_key
            .and_then(|k| tree.entries.get(&k))
            .map(|n| n.key.hash.has_prefix(start))
            .unwrap_or(false);
        Some((
            TreeLocation { tree, cur: min_key, found: false },
            TreeLocation { tree, cur: max_key, found },
        ))
    }

    /// Seek a single ascending cursor to the first entry in `cell`.
    pub fn seek(tree: &'t GeoTree, cell: &GeoHash) -> Self {
        let max_key = tree.first_at_or_after(cell.word());
        let found = max_key
            .and_then(|k| tree.entries.get(&k))
            .map(|n| n.key.hash.has_prefix(cell))
            .unwrap_or(false);
        TreeLocation { tree, cur: max_key, found }
    }

    /// The entry under the cursor, if any.
    pub fn key_node(&self) -> Option<&'t KeyNode> {
        self.cur.and_then(|k| self.tree.entries.get(&k))
    }

    /// Whether the current entry's hash has `prefix`. False once exhausted.
    pub fn has_prefix(&self, prefix: &GeoHash) -> bool {
        self.key_node()
            .map(|n| n.key.hash.has_prefix(prefix))
            .unwrap_or(false)
    }

    /// Step to the next (`+1`) or previous (`-1`) entry. Returns false at
    /// either end of the tree, leaving the cursor exhausted.
    pub fn advance(&mut self, direction: i32) -> bool {
        let Some(cur) = self.cur else { return false };
        self.cur = if direction > 0 {
            self.tree
                .entries
                .range((Bound::Excluded(cur), Bound::Unbounded))
                .next()
                .map(|(k, _)| *k)
        } else {
            self.tree.entries.range(..cur).next_back().map(|(k, _)| *k)
        };
        self.cur.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cur.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> IndexSpec {
        IndexSpec::parse(&json!({"loc": "2d"}), &json!({})).unwrap()
    }

    fn build(points: &[(f64, f64)]) -> (IndexSpec, GeoTree) {
        let spec = spec();
        let mut tree = GeoTree::new();
        for (i, (x, y)) in points.iter().enumerate() {
            tree.insert_document(&spec, i as RecordId, &json!({"loc": [x, y]}))
                .unwrap();
        }
        (spec, tree)
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let spec = spec();
        let mut tree = GeoTree::new();
        let doc = json!({"loc": [[1.0, 2.0], [3.0, 4.0]]});
        assert_eq!(tree.insert_document(&spec, 7, &doc).unwrap(), 2);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.remove_document(&spec, 7, &doc).unwrap(), 2);
        assert!(tree.is_empty());
    }

    #[test]
    fn entries_iterate_in_hash_order() {
        let (_, tree) = build(&[(50.0, 50.0), (-20.0, 10.0), (0.1, 0.1)]);
        let words: Vec<u64> = tree.iter().map(|n| n.key.hash.word()).collect();
        let mut sorted = words.clone();
        sorted.sort_unstable();
        assert_eq!(words, sorted);
    }

    #[test]
    fn initial_partitions_the_tree() {
        let (spec, tree) = build(&[(10.0, 10.0), (10.001, 10.001), (-50.0, -50.0)]);
        let start = spec.hash(10.0, 10.0).unwrap();
        let (mut min, mut max) = TreeLocation::initial(&tree, &start).unwrap();

        // max lands exactly on the sought entry.
        assert!(max.found);
        assert_eq!(max.key_node().unwrap().key.hash, start);

        // min is strictly below, max side covers the rest, nothing twice.
        let mut seen = Vec::new();
        loop {
            match min.key_node() {
                Some(n) => seen.push(n.loc),
                None => break,
            }
            if !min.advance(-1) {
                break;
            }
        }
        loop {
            match max.key_node() {
                Some(n) => seen.push(n.loc),
                None => break,
            }
            if !max.advance(1) {
                break;
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn prefix_sweep_stops_at_cell_boundary() {
        let (spec, tree) = build(&[(10.0, 10.0), (10.0005, 10.0005), (90.0, -40.0)]);
        let start = spec.hash(10.0, 10.0).unwrap();

        // A 10-bit prefix covers the two nearby points but not the far one.
        let mut prefix = start;
        while prefix.bits() > 10 {
            prefix = prefix.up();
        }

        let mut loc = TreeLocation::seek(&tree, &prefix);
        let mut hits = 0;
        while loc.has_prefix(&prefix) {
            hits += 1;
            if !loc.advance(1) {
                break;
            }
        }
        assert_eq!(hits, 2);
    }

    #[test]
    fn empty_tree_has_no_initial_location() {
        let tree = GeoTree::new();
        let start = spec().hash(0.0, 0.0).unwrap();
        assert!(TreeLocation::initial(&tree, &start).is_none());
    }
}
