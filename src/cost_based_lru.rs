//! a [CostBasedLru] is an Lru cache which uses the cost of the items in the cache to decide when to evict.
//!
//! This is implemented as a vec-backed linked list, plus an auxiliary hash-based index from key to slot.  The head of
//! the list is the freshest entry and the tail is the coldest; both touching and evicting are O(1).
//!
//! The engine never calls back into user code.  Anything that leaves the cache because of the budget is handed back
//! to the caller as a list of `(key, value)` pairs, so that wrappers can decide what to do with it (fire a hook,
//! recycle it, or just drop it) after they have released whatever lock protects the engine.
//!
//! Costs are recorded once at insertion and never re-queried.
use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;
use tracing::{debug, trace};

use crate::CacheError;

struct OccupiedEntry<K, V> {
    key: K,
    item: V,
    prev: Option<usize>,
    next: Option<usize>,
    cost: u64,
}

struct EmptyEntry {
    next_empty: Option<usize>,
}

enum CacheEntry<K, V> {
    /// This entry is empty, possibly with a pointer at the next empty entry.
    Empty(EmptyEntry),
    /// This entry is occupied, and doubley linked to the previous and next entry.
    Occupied(OccupiedEntry<K, V>),
}

impl<K, V> CacheEntry<K, V> {
    fn as_occupied_mut(&mut self) -> &mut OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_empty_mut(&mut self) -> &mut EmptyEntry {
        match self {
            CacheEntry::Empty(ref mut x) => x,
            _ => panic!("Entry should be empty"),
        }
    }
}

/// The byte budget of a cache: what is used, what is allowed, and the baseline multipliers are applied to.
#[derive(Copy, Clone, Debug)]
struct SizeTracker {
    initial_max_size: u64,
    max_size: u64,
    current_size: u64,
}

impl SizeTracker {
    fn new(max_size: u64) -> SizeTracker {
        SizeTracker {
            initial_max_size: max_size,
            max_size,
            current_size: 0,
        }
    }

    /// Recompute the ceiling from the baseline.  Does not evict.
    fn rescale(&mut self, multiplier: f32) -> Result<(), CacheError> {
        // Written this way round so that NaN is rejected too.
        if !(multiplier >= 0.0) {
            return Err(CacheError::InvalidMultiplier(multiplier));
        }

        self.max_size = (self.initial_max_size as f64 * multiplier as f64).round() as u64;
        Ok(())
    }
}

/// What happened to a value handed to [CostBasedLru::insert].
#[derive(Debug, PartialEq)]
pub enum Insertion<K, V> {
    /// The value cost at least the whole budget, so it was never linked in.
    ///
    /// Any entry already present under the key is left alone.
    Rejected(K, V),
    /// The value is now the freshest entry.
    Admitted {
        /// The value previously stored under the same key, if any.
        previous: Option<V>,
        /// Entries pushed out to get back under budget, coldest first.
        evicted: Vec<(K, V)>,
    },
}

pub struct CostBasedLru<K, V> {
    entries: Vec<CacheEntry<K, V>>,
    /// Points at the index of the key.
    index: HashMap<K, usize, RandomState>,
    entries_head: Option<usize>,
    entries_tail: Option<usize>,
    empty_head: Option<usize>,
    size: SizeTracker,
}

impl<K: Hash + Eq + Clone, V> CostBasedLru<K, V> {
    pub fn new(max_size: u64) -> CostBasedLru<K, V> {
        CostBasedLru {
            entries: Default::default(),
            index: Default::default(),
            entries_head: None,
            entries_tail: None,
            empty_head: None,
            size: SizeTracker::new(max_size),
        }
    }

    /// Entirely unlink an occupied index from the list.
    /// Used as a precursor step to lots of things such as patching up the head.
    fn unlink_index(&mut self, index: usize) {
        // Easiest to handle the tail first.
        if Some(index) == self.entries_tail {
            self.entries_tail = self.entries[index].as_occupied().prev;
        }

        if Some(index) == self.entries_head {
            // unlinking the head is special.
            self.entries_head = self.entries[index].as_occupied_mut().next;
            if let Some(n) = self.entries_head {
                self.entries[n].as_occupied_mut().prev = None;
            }

            return;
        }

        // Otherwise we just do a standard linked list unlink.
        let old_prev = self.entries[index]
            .as_occupied_mut()
            .prev
            .expect("Isn't the head");
        let old_next = self.entries[index].as_occupied_mut().next;
        self.entries[old_prev].as_occupied_mut().next = old_next;
        if let Some(n) = old_next {
            self.entries[n].as_occupied_mut().prev = Some(old_prev);
        }
    }

    /// Given the index of an occupied entry, make it the most recent item.
    fn make_most_recent(&mut self, index: usize) {
        if Some(index) == self.entries_head {
            return;
        }

        self.unlink_index(index);
        {
            let entry = self.entries[index].as_occupied_mut();
            entry.prev = None;
            entry.next = self.entries_head;
        }
        if let Some(i) = self.entries_head {
            self.entries[i].as_occupied_mut().prev = Some(index);
        }
        self.entries_head = Some(index);

        // If this is the only entry, then unlinking it broke the tail.
        if self.entries_tail.is_none() {
            self.entries_tail = Some(index);
        }
    }

    /// Look up a value, making it the freshest entry.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        self.make_most_recent(ind);
        Some(&self.entries[ind].as_occupied().item)
    }

    /// Look up a value without changing the recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        Some(&self.entries[ind].as_occupied().item)
    }

    /// Presence check.  Does not change the recency order.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Make a specific index of the map become empty, returning what was there.
    fn become_empty(&mut self, index: usize) -> (K, V) {
        self.unlink_index(index);
        let mut old = CacheEntry::Empty(EmptyEntry {
            next_empty: self.empty_head,
        });
        std::mem::swap(&mut old, &mut self.entries[index]);
        self.empty_head = Some(index);
        match old {
            CacheEntry::Occupied(OccupiedEntry {
                key, item, cost, ..
            }) => {
                self.index.remove(&key);
                self.size.current_size -= cost;
                (key, item)
            }
            _ => panic!("Should have been occupied"),
        }
    }

    /// Remove an entry.  The caller gets the value back; nothing counts this as an eviction.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let ind = self.index.remove(key)?;
        let (_, old) = self.become_empty(ind);
        Some(old)
    }

    /// Find an available empty index, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.entries[e].as_empty_mut().next_empty;
            return e;
        }

        self.entries
            .push(CacheEntry::Empty(EmptyEntry { next_empty: None }));
        self.entries.len() - 1
    }

    /// Add an entry to the cache as the freshest entry, first evicting whatever is needed to make room for it.
    ///
    /// A value whose cost is at least the current maximum size is handed straight back as
    /// [Insertion::Rejected], and in that case an older entry under the same key stays where it is.
    pub fn insert(&mut self, key: K, value: V, cost: u64) -> Insertion<K, V> {
        if cost >= self.size.max_size {
            trace!(cost, max_size = self.size.max_size, "rejected oversized entry");
            return Insertion::Rejected(key, value);
        }

        let previous = self.remove(&key);
        // Room is made before the cost is added, so the size never exceeds the maximum, even transiently.
        let evicted = self.trim_to_size(self.size.max_size - cost);
        let ind = self.find_empty();
        let old_head = self.entries_head;

        self.entries[ind] = CacheEntry::Occupied(OccupiedEntry {
            key: key.clone(),
            item: value,
            prev: None,
            next: self.entries_head,
            cost,
        });
        self.entries_head = Some(ind);
        self.index.insert(key, ind);
        self.size.current_size += cost;

        // Link up the prev of the old head.
        if let Some(h) = old_head {
            self.entries[h].as_occupied_mut().prev = self.entries_head;
        }

        // If there's no tail this was the first insert and we need one.
        if self.entries_tail.is_none() {
            self.entries_tail = Some(ind);
        }

        Insertion::Admitted { previous, evicted }
    }

    /// Run a cache eviction if required.
    fn evict(&mut self) -> Vec<(K, V)> {
        self.trim_to_size(self.size.max_size)
    }

    /// Evict the coldest entries one at a time until the current size is at most `target`.
    pub fn trim_to_size(&mut self, target: u64) -> Vec<(K, V)> {
        let mut evicted = vec![];
        while self.size.current_size > target {
            let cur = match self.entries_tail {
                Some(t) => t,
                None => panic!("Not enough entries to explain cost"),
            };

            evicted.push(self.become_empty(cur));
            trace!(
                current_size = self.size.current_size,
                target,
                "evicted coldest entry"
            );
        }

        evicted
    }

    /// Evict every entry, coldest first.
    ///
    /// Unlike `trim_to_size(0)`, this also drains entries which cost nothing.
    pub fn clear(&mut self) -> Vec<(K, V)> {
        let mut evicted = Vec::with_capacity(self.index.len());
        while let Some(t) = self.entries_tail {
            evicted.push(self.become_empty(t));
        }

        debug_assert_eq!(self.size.current_size, 0);
        evicted
    }

    /// Set the maximum size to `initial_max_size * multiplier`, rounded, and evict down to it.
    pub fn set_size_multiplier(&mut self, multiplier: f32) -> Result<Vec<(K, V)>, CacheError> {
        self.size.rescale(multiplier)?;
        debug!(
            multiplier,
            max_size = self.size.max_size,
            current_size = self.size.current_size,
            "rescaled cache budget"
        );
        Ok(self.evict())
    }

    pub fn max_size(&self) -> u64 {
        self.size.max_size
    }

    pub fn initial_max_size(&self) -> u64 {
        self.size.initial_max_size
    }

    pub fn current_size(&self) -> u64 {
        self.size.current_size
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.iter_entries().map(|e| (&e.key, &e.item))
    }

    fn iter_entries(&self) -> impl Iterator<Item = &OccupiedEntry<K, V>> {
        let mut ind = self.entries_head;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.next;
            Some(ret)
        })
    }
}
