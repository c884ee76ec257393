//! Recency index over tenant database names.
//!
//! A doubly linked list threaded through a slab of nodes, with a hash map from
//! key to slot. Every operation is O(1); the head is the least recently used
//! entry and the tail the most recently used one.

use std::collections::HashMap;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: String,
    prev: usize,
    next: usize,
}

/// Least-recently-used ordering of keys. A key appears at most once.
#[derive(Debug)]
pub struct LruIndex {
    nodes: Vec<Node>,
    /// Vacant slots available for reuse.
    free: Vec<usize>,
    slots: HashMap<String, usize>,
    head: usize,
    tail: usize,
}

impl Default for LruIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl LruIndex {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            slots: HashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert `key` at the most-recently-used end, or move it there if present.
    pub fn push(&mut self, key: &str) {
        if self.touch(key) {
            return;
        }
        let node = Node {
            key: key.to_string(),
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.slots.insert(key.to_string(), slot);
        self.link_back(slot);
    }

    /// Move `key` to the most-recently-used end. Returns `false` if absent.
    pub fn touch(&mut self, key: &str) -> bool {
        let Some(&slot) = self.slots.get(key) else {
            return false;
        };
        if slot != self.tail {
            self.unlink(slot);
            self.link_back(slot);
        }
        true
    }

    /// Remove `key`. Returns `false` if absent.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(slot) = self.slots.remove(key) else {
            return false;
        };
        self.unlink(slot);
        self.nodes[slot].key.clear();
        self.free.push(slot);
        true
    }

    /// Remove and return the least recently used key.
    pub fn pop_oldest(&mut self) -> Option<String> {
        if self.head == NIL {
            return None;
        }
        let slot = self.head;
        let key = std::mem::take(&mut self.nodes[slot].key);
        self.slots.remove(&key);
        self.unlink(slot);
        self.free.push(slot);
        Some(key)
    }

    /// Keys from least to most recently used.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            index: self,
            cursor: self.head,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn link_back(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = NIL;
        if self.tail == NIL {
            self.head = slot;
        } else {
            self.nodes[self.tail].next = slot;
        }
        self.tail = slot;
    }
}

/// Iterator over [`LruIndex`] keys, oldest first.
pub struct Iter<'a> {
    index: &'a LruIndex,
    cursor: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.index.nodes[self.cursor];
        self.cursor = node.next;
        Some(node.key.as_str())
    }
}
