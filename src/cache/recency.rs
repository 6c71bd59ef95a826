//! Recency tracking for resident tiles.
//!
//! An intrusive doubly linked list threaded through an index arena, looked up
//! by a hash map. `touch` and `remove` are O(1); victim selection walks from
//! the least-recent end and stops at the first unprotected key.

use std::collections::HashMap;

use crate::cache::key::{ProtectedSet, TileKey};

const NIL: usize = usize::MAX;

#[derive(Debug, Clone)]
struct Node {
    key: TileKey,
    prev: usize,
    next: usize,
}

/// LRU ordering of resident keys.
#[derive(Debug, Default)]
pub struct RecencyTracker {
    nodes: Vec<Node>,
    free_nodes: Vec<usize>,
    index: HashMap<TileKey, usize>,
    /// Least recently used.
    head: Option<usize>,
    /// Most recently used.
    tail: Option<usize>,
}

impl RecencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the arena for `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            free_nodes: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    /// Mark `key` most recently used, inserting it if untracked.
    pub fn touch(&mut self, key: TileKey) {
        if let Some(&idx) = self.index.get(&key) {
            if self.tail == Some(idx) {
                return;
            }
            self.unlink(idx);
            self.push_back(idx);
            return;
        }

        let idx = match self.free_nodes.pop() {
            Some(idx) => {
                self.nodes[idx] = Node { key, prev: NIL, next: NIL };
                idx
            }
            None => {
                self.nodes.push(Node { key, prev: NIL, next: NIL });
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_back(idx);
    }

    /// Stop tracking `key`. Returns whether it was tracked.
    pub fn remove(&mut self, key: &TileKey) -> bool {
        match self.index.remove(key) {
            Some(idx) => {
                self.unlink(idx);
                self.free_nodes.push(idx);
                true
            }
            None => false,
        }
    }

    /// The least recently used key not in `protected`.
    pub fn least_recent_unprotected(&self, protected: &ProtectedSet) -> Option<TileKey> {
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            if !protected.contains(&node.key) {
                return Some(node.key);
            }
            cursor = (node.next != NIL).then_some(node.next);
        }
        None
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keys from least to most recently used.
    pub fn iter(&self) -> RecencyIter<'_> {
        RecencyIter {
            tracker: self,
            cursor: self.head,
        }
    }

    fn push_back(&mut self, idx: usize) {
        self.nodes[idx].prev = self.tail.unwrap_or(NIL);
        self.nodes[idx].next = NIL;
        match self.tail {
            Some(tail) => self.nodes[tail].next = idx,
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let Node { prev, next, .. } = self.nodes[idx];

        if prev == NIL {
            self.head = (next != NIL).then_some(next);
        } else {
            self.nodes[prev].next = next;
        }

        if next == NIL {
            self.tail = (prev != NIL).then_some(prev);
        } else {
            self.nodes[next].prev = prev;
        }

        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }
}

/// Iterator over tracked keys, LRU first.
pub struct RecencyIter<'a> {
    tracker: &'a RecencyTracker,
    cursor: Option<usize>,
}

impl Iterator for RecencyIter<'_> {
    type Item = TileKey;

    fn next(&mut self) -> Option<TileKey> {
        let idx = self.cursor?;
        let node = &self.tracker.nodes[idx];
        self.cursor = (node.next != NIL).then_some(node.next);
        Some(node.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(x: u32) -> TileKey {
        TileKey::new(x, 0, 0)
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        let mut lru = RecencyTracker::new();
        lru.touch(k(1));
        lru.touch(k(2));
        lru.touch(k(3));
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec![k(1), k(2), k(3)]);
        assert_eq!(lru.least_recent_unprotected(&ProtectedSet::new()), Some(k(1)));
    }

    #[test]
    fn test_touch_moves_to_most_recent() {
        let mut lru = RecencyTracker::new();
        for x in 1..=3 {
            lru.touch(k(x));
        }
        lru.touch(k(1));
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec![k(2), k(3), k(1)]);

        // Touching the tail is a no-op.
        lru.touch(k(1));
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec![k(2), k(3), k(1)]);
        assert_eq!(lru.len(), 3);
    }

    #[test]
    fn test_remove_relinks_neighbours() {
        let mut lru = RecencyTracker::new();
        for x in 1..=4 {
            lru.touch(k(x));
        }
        assert!(lru.remove(&k(2)));
        assert!(lru.remove(&k(4)));
        assert!(!lru.remove(&k(4)));
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec![k(1), k(3)]);

        assert!(lru.remove(&k(1)));
        assert!(lru.remove(&k(3)));
        assert!(lru.is_empty());
        assert_eq!(lru.iter().count(), 0);
    }

    #[test]
    fn test_freed_nodes_are_reused() {
        let mut lru = RecencyTracker::with_capacity(2);
        lru.touch(k(1));
        lru.touch(k(2));
        lru.remove(&k(1));
        lru.touch(k(3));
        assert_eq!(lru.nodes.len(), 2);
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec![k(2), k(3)]);
    }

    #[test]
    fn test_protected_keys_are_skipped() {
        let mut lru = RecencyTracker::new();
        for x in 1..=3 {
            lru.touch(k(x));
        }
        let protected: ProtectedSet = [k(1), k(2)].into_iter().collect();
        assert_eq!(lru.least_recent_unprotected(&protected), Some(k(3)));

        let all: ProtectedSet = (1..=3).map(k).collect();
        assert_eq!(lru.least_recent_unprotected(&all), None);
    }
}
