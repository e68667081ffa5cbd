//! Bounded least-recently-used map from frame identifiers to resolved names.
//!
//! Entries live in a slab (`Vec`) and are threaded onto an intrusive
//! doubly-linked recency list by index, so `get` and `put` are O(1) and the
//! cache never allocates once it has reached capacity.

use std::collections::HashMap;
use std::hash::Hash;

struct Entry<K, V> {
    key: K,
    value: V,
    /// Towards the most-recently-used end.
    prev: Option<usize>,
    /// Towards the least-recently-used end.
    next: Option<usize>,
}

pub struct NameCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    entries: Vec<Entry<K, V>>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used; next to be evicted.
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> NameCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity.min(1024)),
            entries: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.move_to_front(idx);
        Some(&self.entries[idx].value)
    }

    /// Look up `key` without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&idx| &self.entries[idx].value)
    }

    /// Insert `key` as most recently used.
    ///
    /// Returns the entry displaced by the insert: the previous value under the
    /// same key, or the least-recently-used entry when the cache was full.
    /// Ownership of the displaced value passes to the caller.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.capacity == 0 {
            return Some((key, value));
        }
        if let Some(&idx) = self.index.get(&key) {
            let old = std::mem::replace(&mut self.entries[idx].value, value);
            self.move_to_front(idx);
            return Some((key, old));
        }
        if self.entries.len() < self.capacity {
            let idx = self.entries.len();
            self.entries.push(Entry {
                key: key.clone(),
                value,
                prev: None,
                next: None,
            });
            self.index.insert(key, idx);
            self.link_front(idx);
            return None;
        }

        // Full: recycle the least-recently-used slot for the new entry.
        let idx = self.tail?;
        self.unlink(idx);
        let evicted_key = std::mem::replace(&mut self.entries[idx].key, key.clone());
        let evicted_value = std::mem::replace(&mut self.entries[idx].value, value);
        self.index.remove(&evicted_key);
        self.index.insert(key, idx);
        self.link_front(idx);
        Some((evicted_key, evicted_value))
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> impl Iterator<Item = &K> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            cursor = self.entries[idx].next;
            Some(&self.entries[idx].key)
        })
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[idx].prev = None;
        self.entries[idx].next = None;
    }

    fn link_front(&mut self, idx: usize) {
        self.entries[idx].prev = None;
        self.entries[idx].next = self.head;
        if let Some(h) = self.head {
            self.entries[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}
