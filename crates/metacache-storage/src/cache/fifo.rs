//! Insertion-ordered cache

use super::Slab;
use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    next: Option<usize>,
}

/// Cache that evicts in insertion order
///
/// Entries form a singly linked list from oldest (head) to newest (tail).
/// Lookups never reorder entries.
pub struct FifoCache<K, V> {
    slab: Slab<Node<K, V>>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> FifoCache<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
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

    /// Insert a new entry as the newest
    ///
    /// If the key is already cached nothing changes and the existing value
    /// is returned for the caller to merge into.
    pub fn add(&mut self, key: K, value: V) -> Result<(), &mut V> {
        if let Some(&idx) = self.index.get(&key) {
            return Err(&mut self.slab[idx].value);
        }

        let idx = self.slab.insert(Node {
            key: key.clone(),
            value,
            next: None,
        });
        match self.tail {
            Some(tail) => self.slab[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.index.insert(key, idx);
        Ok(())
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        Some(&self.slab[idx].value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        Some(&mut self.slab[idx].value)
    }

    /// Remove one entry
    ///
    /// The list is singly linked, so this walks from the head to find the
    /// predecessor.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        let next = self.slab[idx].next;
        let prev = std::iter::successors(self.head, |&i| self.slab[i].next)
            .find(|&i| self.slab[i].next == Some(idx));
        match prev {
            Some(p) => self.slab[p].next = next,
            None => self.head = next,
        }
        if self.tail == Some(idx) {
            self.tail = prev;
        }
        self.slab.remove(idx).map(|node| node.value)
    }

    /// Evict from the oldest end while `len() >= threshold`
    ///
    /// Returns the number of evicted entries.
    pub fn remove_oldest(&mut self, threshold: usize) -> usize {
        let mut evicted = 0;
        while self.len() >= threshold && self.pop_oldest().is_some() {
            evicted += 1;
        }
        evicted
    }

    /// Remove and return the oldest entry
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let idx = self.head?;
        let node = self.slab.remove(idx)?;
        self.head = node.next;
        if self.head.is_none() {
            self.tail = None;
        }
        self.index.remove(&node.key);
        Some((node.key, node.value))
    }

    pub fn clear(&mut self) {
        self.slab.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from oldest to newest
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        std::iter::successors(self.head, |&idx| self.slab[idx].next).map(|idx| &self.slab[idx].key)
    }
}

impl<K: Hash + Eq + Clone, V> Default for FifoCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
