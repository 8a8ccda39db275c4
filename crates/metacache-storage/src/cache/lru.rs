//! Least-recently-used cache

use super::Slab;
use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Cache that evicts the least recently touched entry
///
/// Entries form a doubly linked list from oldest (head) to newest (tail).
/// A hit only counts as a touch once the caller promotes it with
/// [`make_newest`](Self::make_newest) or reads through
/// [`get_newest`](Self::get_newest).
pub struct LruCache<K, V> {
    slab: Slab<Node<K, V>>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
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
    /// If the key is already cached nothing changes, not even its
    /// position, and the existing value is returned for the caller to
    /// merge into.
    pub fn add(&mut self, key: K, value: V) -> Result<(), &mut V> {
        if let Some(&idx) = self.index.get(&key) {
            return Err(&mut self.slab[idx].value);
        }

        let idx = self.slab.insert(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.link_back(idx);
        self.index.insert(key, idx);
        Ok(())
    }

    /// Look up without promoting
    pub fn get(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        Some(&self.slab[idx].value)
    }

    /// Look up for modification without promoting
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        Some(&mut self.slab[idx].value)
    }

    /// Look up and promote to newest
    pub fn get_newest(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.promote(idx);
        Some(&mut self.slab[idx].value)
    }

    /// Move an entry to the newest position
    ///
    /// Returns false if the key is not cached.
    pub fn make_newest(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.promote(idx);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
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

    /// Remove and return the least recently touched entry
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let idx = self.head?;
        self.unlink(idx);
        let node = self.slab.remove(idx)?;
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

    fn promote(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_back(idx);
    }

    fn link_back(&mut self, idx: usize) {
        let node = &mut self.slab[idx];
        node.prev = self.tail;
        node.next = None;
        match self.tail {
            Some(tail) => self.slab[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = &mut self.slab[idx];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(p) => self.slab[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].prev = prev,
            None => self.tail = prev,
        }
    }
}

impl<K: Hash + Eq + Clone, V> Default for LruCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn order(cache: &LruCache<u32, u32>) -> Vec<u32> {
        cache.keys().copied().collect()
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        const CAPACITY: usize = 3;
        let mut cache = LruCache::new();
        for i in 0..=CAPACITY as u32 {
            cache.add(i, i).unwrap();
            cache.remove_oldest(CAPACITY + 1);
        }
        assert_eq!(order(&cache), vec![1, 2, 3]);
        assert!(!cache.contains(&0));
    }

    #[test]
    fn test_touched_key_outlives_untouched() {
        const CAPACITY: u32 = 4;
        let mut cache = LruCache::new();
        for i in 0..CAPACITY {
            cache.add(i, i).unwrap();
        }

        // Touch the oldest, then insert CAPACITY - 1 new keys
        assert_eq!(cache.get_newest(&0).copied(), Some(0));
        for i in CAPACITY..(2 * CAPACITY - 1) {
            cache.add(i, i).unwrap();
            cache.remove_oldest(CAPACITY as usize + 1);
        }

        // Every other original key is gone, the touched one is not
        assert!(cache.contains(&0));
        for i in 1..CAPACITY {
            assert!(!cache.contains(&i), "key {i} should be evicted");
        }

        // One more insert evicts it
        cache.add(100, 100).unwrap();
        cache.remove_oldest(CAPACITY as usize + 1);
        assert!(!cache.contains(&0));
    }

    #[test]
    fn test_make_newest() {
        let mut cache = LruCache::new();
        for i in 0..4 {
            cache.add(i, i).unwrap();
        }
        assert!(cache.make_newest(&1));
        assert!(cache.make_newest(&3));
        assert!(cache.make_newest(&0));
        assert!(!cache.make_newest(&9));
        assert_eq!(order(&cache), vec![2, 1, 3, 0]);

        // Plain reads do not promote
        cache.get(&2);
        cache.get_mut(&2);
        assert_eq!(cache.pop_oldest(), Some((2, 2)));
    }

    #[test]
    fn test_duplicate_add_keeps_position() {
        let mut cache = LruCache::new();
        cache.add(1, 10).unwrap();
        cache.add(2, 20).unwrap();

        let existing = cache.add(1, 11).unwrap_err();
        *existing += 1;
        assert_eq!(cache.get(&1), Some(&11));
        assert_eq!(order(&cache), vec![1, 2]);
    }

    #[test]
    fn test_remove() {
        let mut cache = LruCache::new();
        for i in 0..3 {
            cache.add(i, i * 2).unwrap();
        }
        assert_eq!(cache.remove(&1), Some(2));
        assert_eq!(cache.remove(&1), None);
        assert_eq!(order(&cache), vec![0, 2]);

        assert_eq!(cache.remove(&0), Some(0));
        assert_eq!(cache.remove(&2), Some(4));
        assert!(cache.is_empty());
        assert_eq!(cache.pop_oldest(), None);

        cache.add(7, 7).unwrap();
        assert_eq!(order(&cache), vec![7]);
    }

    #[test]
    fn test_clear_twice() {
        let mut cache = LruCache::new();
        cache.add(1, 1).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(order(&cache), Vec::<u32>::new());
    }

    #[test]
    fn test_matches_reference_model() {
        let mut rng = rand::thread_rng();
        let mut cache = LruCache::new();
        let mut model: Vec<u32> = Vec::new();
        const CAPACITY: usize = 8;

        for _ in 0..2000 {
            let key = rng.gen_range(0..20u32);
            match rng.gen_range(0..4) {
                0 | 1 => {
                    if cache.add(key, key).is_ok() {
                        model.push(key);
                    }
                    cache.remove_oldest(CAPACITY + 1);
                    while model.len() > CAPACITY {
                        model.remove(0);
                    }
                }
                2 => {
                    let hit = cache.get_newest(&key).is_some();
                    let pos = model.iter().position(|&k| k == key);
                    assert_eq!(hit, pos.is_some());
                    if let Some(pos) = pos {
                        let k = model.remove(pos);
                        model.push(k);
                    }
                }
                _ => {
                    let removed = cache.remove(&key).is_some();
                    let pos = model.iter().position(|&k| k == key);
                    assert_eq!(removed, pos.is_some());
                    if let Some(pos) = pos {
                        model.remove(pos);
                    }
                }
            }
            assert_eq!(order(&cache), model);
        }
    }
}
