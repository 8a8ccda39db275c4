//! In-process eviction caches
//!
//! Two bounded-by-caller caches used in front of slower lookups:
//!
//! - [`FifoCache`]: evicts in insertion order, reads never reorder
//! - [`LruCache`]: evicts the least recently touched entry
//!
//! Entries live in a slab and the eviction order is a linked list of slab
//! indices, so every operation is O(1) without raw pointers. Neither cache
//! locks internally and neither enforces a capacity: callers wrap them in a
//! mutex and call `remove_oldest(capacity + 1)` after inserting. Evicted
//! values are dropped, so any resource they hold is released by `Drop`.

mod fifo;
mod lru;

pub use fifo::FifoCache;
pub use lru::LruCache;

use std::ops::{Index, IndexMut};

/// Vector of reusable slots
#[derive(Debug)]
struct Slab<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slab<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(value);
                idx
            }
            None => {
                self.entries.push(Some(value));
                self.entries.len() - 1
            }
        }
    }

    fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.entries.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(value)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.free.clear();
    }
}

impl<T> Index<usize> for Slab<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &T {
        match self.entries.get(idx) {
            Some(Some(value)) => value,
            _ => panic!("vacant cache slot {idx}"),
        }
    }
}

impl<T> IndexMut<usize> for Slab<T> {
    fn index_mut(&mut self, idx: usize) -> &mut T {
        match self.entries.get_mut(idx) {
            Some(Some(value)) => value,
            _ => panic!("vacant cache slot {idx}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_reuses_slots() {
        let mut slab = Slab::with_capacity(4);
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);

        let c = slab.insert("c");
        assert_eq!(c, a);
        assert_eq!(slab[b], "b");
        assert_eq!(slab[c], "c");

        slab.clear();
        assert_eq!(slab.insert("d"), 0);
    }
}
