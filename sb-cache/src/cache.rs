use std::collections::{BTreeMap, HashMap};

/// Opaque handle to one stored value, returned by lookups and accepted by
/// [`Cache::lock`]/[`Cache::unlock`]/[`Cache::remove_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle(u64);

/// A value plus the bookkeeping `Cache` needs to store it: how much of the
/// size budget it consumes and when it expires. Grounded on
/// `original_source/src/cache.c`'s `struct cache_item` (`size`, `expires`,
/// `key`, `lock`, `removed`, `sorted_siblings`).
pub struct CacheEntry<V> {
    pub value: V,
    pub size: usize,
    pub expires: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, size: usize, expires: u64) -> Self {
        Self { value, size, expires }
    }
}

type ValidateFn<V> = Box<dyn Fn(&V) -> bool>;

struct Slot<V> {
    key: String,
    value: V,
    size: usize,
    expires: u64,
    last_accessed: u64,
    seq: u64,
    lock: u32,
    removed: bool,
}

/// Size-bounded, LRU-ordered associative store with per-item lock counts
/// and background expiry — spec §4.6 "Generic cache". Grounded on
/// `original_source/src/cache.c`'s `struct cache`/`cache_item` pair: a
/// hashmap keyed index plus a single recency-ordered list, with eviction
/// always picking the LRU tail even if that item happens to be locked
/// (its destruction is then deferred to `unlock`, matching
/// `cache_item_removed`).
///
/// The original's intrusive `sorted_siblings` linked list is expressed
/// here as a `BTreeMap` keyed on a monotonically increasing sequence
/// number — the same strict-recency order, without hand-rolling an
/// intrusive list in safe Rust.
pub struct Cache<V> {
    max_size: usize,
    size: usize,
    next_id: u64,
    next_seq: u64,
    slots: HashMap<u64, Slot<V>>,
    by_key: HashMap<String, Vec<u64>>,
    by_seq: BTreeMap<u64, u64>,
    validate: Option<ValidateFn<V>>,
}

impl<V> Cache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            size: 0,
            next_id: 0,
            next_seq: 0,
            slots: HashMap::new(),
            by_key: HashMap::new(),
            by_seq: BTreeMap::new(),
            validate: None,
        }
    }

    /// Install an extra per-item validity check beyond expiry, matching
    /// the original's `cache_class::validate` callback.
    pub fn with_validate(mut self, validate: impl Fn(&V) -> bool + 'static) -> Self {
        self.validate = Some(Box::new(validate));
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| !s.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a value by handle. Still returns `Some` for a removed-but-
    /// locked item — its destruction is postponed to `unlock`, not its
    /// readability.
    pub fn value(&self, handle: CacheHandle) -> Option<&V> {
        self.slots.get(&handle.0).map(|s| &s.value)
    }

    pub fn last_accessed(&self, handle: CacheHandle) -> Option<u64> {
        self.slots.get(&handle.0).map(|s| s.last_accessed)
    }

    fn is_valid(&self, slot: &Slot<V>, now: u64) -> bool {
        now < slot.expires && self.validate.as_ref().is_none_or(|f| f(&slot.value))
    }

    /// Detach a slot from the index and recency list; destroys it (drops
    /// the value) immediately unless it's locked, in which case the drop
    /// is postponed to [`Self::unlock`] — matches `cache_item_removed`.
    fn remove_slot(&mut self, id: u64) {
        let Some(slot) = self.slots.get_mut(&id) else { return };
        debug_assert!(slot.lock > 0 || !slot.removed);

        self.by_seq.remove(&slot.seq);
        if let Some(ids) = self.by_key.get_mut(&slot.key) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.by_key.remove(&slot.key);
            }
        }

        self.size -= slot.size;

        if slot.lock == 0 {
            self.slots.remove(&id);
        } else {
            slot.removed = true;
        }
    }

    fn touch(&mut self, id: u64, now: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(slot) = self.slots.get_mut(&id) {
            self.by_seq.remove(&slot.seq);
            slot.seq = seq;
            slot.last_accessed = now;
            self.by_seq.insert(seq, id);
        }
    }

    /// Evict the LRU tail (oldest `seq`) until `size` fits, bailing out if
    /// `size` alone can never fit within `max_size` — matches
    /// `cache_need_room`/`cache_destroy_oldest_item`.
    fn need_room(&mut self, size: usize) -> bool {
        if size > self.max_size {
            return false;
        }
        while self.size + size > self.max_size {
            let Some((&_seq, &id)) = self.by_seq.iter().next() else {
                break;
            };
            tracing::debug!(size, cache_size = self.size, max_size = self.max_size, "evicting LRU tail for room");
            self.remove_slot(id);
        }
        true
    }

    fn insert_slot(&mut self, key: &str, entry: CacheEntry<V>, now: u64) -> CacheHandle {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.size += entry.size;
        self.by_key.entry(key.to_string()).or_default().push(id);
        self.by_seq.insert(seq, id);
        self.slots.insert(
            id,
            Slot {
                key: key.to_string(),
                value: entry.value,
                size: entry.size,
                expires: entry.expires,
                last_accessed: now,
                seq,
                lock: 0,
                removed: false,
            },
        );
        CacheHandle(id)
    }

    /// Insert a new item, allowing multiple items to coexist under the
    /// same key — matches `cache_add`. The item is dropped (never
    /// stored) if it alone exceeds `max_size`.
    pub fn add(&mut self, key: &str, entry: CacheEntry<V>, now: u64) -> Option<CacheHandle> {
        if !self.need_room(entry.size) {
            return None;
        }
        Some(self.insert_slot(key, entry, now))
    }

    /// Insert an item, replacing (and removing) any existing item under
    /// the same key — matches `cache_put`.
    pub fn put(&mut self, key: &str, entry: CacheEntry<V>, now: u64) -> Option<CacheHandle> {
        if !self.need_room(entry.size) {
            return None;
        }
        if let Some(ids) = self.by_key.get(key).cloned() {
            for id in ids {
                self.remove_slot(id);
            }
        }
        Some(self.insert_slot(key, entry, now))
    }

    /// Insert an item, replacing only the item under `key` that matches
    /// `pred` (if any) — matches `cache_put_match`.
    pub fn put_match(
        &mut self,
        key: &str,
        entry: CacheEntry<V>,
        now: u64,
        pred: impl Fn(&V) -> bool,
    ) -> Option<CacheHandle> {
        if let Some(old) = self.get_match(key, now, &pred) {
            self.remove_item(old);
        }
        self.add(key, entry, now)
    }

    /// Return the most-recently-inserted live item for `key`, refreshing
    /// its recency on a hit (matches `cache_get`).
    pub fn get(&mut self, key: &str, now: u64) -> Option<CacheHandle> {
        self.get_match(key, now, |_| true)
    }

    /// Walk items under `key`, newest first, evicting expired/invalid
    /// ones along the way, until `pred` accepts one (matches
    /// `cache_get_match`).
    pub fn get_match(&mut self, key: &str, now: u64, pred: impl Fn(&V) -> bool) -> Option<CacheHandle> {
        loop {
            let ids = self.by_key.get(key)?.clone();
            let mut found = None;
            let mut expired = None;
            for &id in ids.iter().rev() {
                let slot = self.slots.get(&id)?;
                if !self.is_valid(slot, now) {
                    expired = Some(id);
                    break;
                }
                if pred(&slot.value) {
                    found = Some(id);
                    break;
                }
            }

            if let Some(id) = expired {
                self.remove_slot(id);
                continue;
            }

            return found.map(|id| {
                self.touch(id, now);
                CacheHandle(id)
            });
        }
    }

    /// Remove every item stored under `key` (matches `cache_remove`).
    pub fn remove(&mut self, key: &str) -> usize {
        let ids = self.by_key.get(key).cloned().unwrap_or_default();
        for &id in &ids {
            self.remove_slot(id);
        }
        ids.len()
    }

    /// Remove every item under `key` matching `pred` (matches
    /// `cache_remove_match`).
    pub fn remove_match(&mut self, key: &str, pred: impl Fn(&V) -> bool) -> usize {
        let ids = self.by_key.get(key).cloned().unwrap_or_default();
        let mut removed = 0;
        for id in ids {
            let matches = self.slots.get(&id).is_some_and(|s| pred(&s.value));
            if matches {
                self.remove_slot(id);
                removed += 1;
            }
        }
        removed
    }

    /// Remove every item in the cache matching `pred`, regardless of key
    /// (matches `cache_remove_all_match`).
    pub fn remove_all_match(&mut self, pred: impl Fn(&V) -> bool) -> usize {
        let ids: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, s)| !s.removed && pred(&s.value))
            .map(|(&id, _)| id)
            .collect();
        for &id in &ids {
            self.remove_slot(id);
        }
        ids.len()
    }

    /// Remove one specific item by handle, a no-op if it was already
    /// removed by somebody else (matches `cache_remove_item`).
    pub fn remove_item(&mut self, handle: CacheHandle) {
        if self.slots.get(&handle.0).is_some_and(|s| !s.removed) {
            self.remove_slot(handle.0);
        }
    }

    /// Increment a locked item's reference count, deferring its
    /// destruction past any `remove` while held (matches
    /// `cache_item_lock`).
    pub fn lock(&mut self, handle: CacheHandle) {
        if let Some(slot) = self.slots.get_mut(&handle.0) {
            slot.lock += 1;
        }
    }

    /// Decrement a locked item's reference count; if it was removed
    /// while locked and this is the last reference, destroy it now
    /// (matches `cache_item_unlock`).
    pub fn unlock(&mut self, handle: CacheHandle) {
        let Some(slot) = self.slots.get_mut(&handle.0) else {
            return;
        };
        debug_assert!(slot.lock > 0);
        slot.lock -= 1;
        if slot.lock == 0 && slot.removed {
            self.slots.remove(&handle.0);
        }
    }

    /// Drop every item, respecting locks (matches `cache_flush`).
    pub fn flush(&mut self) {
        let ids: Vec<u64> = self.by_seq.values().copied().collect();
        for id in ids {
            self.remove_slot(id);
        }
    }

    /// One sweep of the background expiry timer: evict every item whose
    /// `expires <= now`, independent of recency order. Returns whether
    /// the cache is still non-empty, the original's convention for
    /// deciding whether to re-arm the 60s timer (matches
    /// `cache_expire_callback`).
    pub fn expire_once(&mut self, now: u64) -> bool {
        let expired: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, s)| !s.removed && s.expires <= now)
            .map(|(&id, _)| id)
            .collect();
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "expiring cache items");
        }
        for id in expired {
            self.remove_slot(id);
        }
        self.size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let mut cache = Cache::new(100);
        let h = cache.put("a", CacheEntry::new("va", 10, 1000), 0).unwrap();
        assert_eq!(cache.value(h), Some(&"va"));
        let got = cache.get("a", 0).unwrap();
        assert_eq!(cache.value(got), Some(&"va"));
    }

    #[test]
    fn test_put_replaces_existing_key() {
        let mut cache = Cache::new(100);
        cache.put("a", CacheEntry::new("v1", 10, 1000), 0).unwrap();
        cache.put("a", CacheEntry::new("v2", 10, 1000), 0).unwrap();
        assert_eq!(cache.size(), 10);
        let h = cache.get("a", 0).unwrap();
        assert_eq!(cache.value(h), Some(&"v2"));
    }

    #[test]
    fn test_add_allows_multiple_items_per_key() {
        let mut cache = Cache::new(100);
        cache.add("a", CacheEntry::new("v1", 10, 1000), 0).unwrap();
        cache.add("a", CacheEntry::new("v2", 10, 1000), 1).unwrap();
        assert_eq!(cache.size(), 20);
        let h = cache.get("a", 2).unwrap();
        assert_eq!(cache.value(h), Some(&"v2"), "get returns newest item for key");
    }

    #[test]
    fn test_get_match_walks_to_first_matching_item() {
        let mut cache = Cache::new(100);
        cache.add("a", CacheEntry::new(1, 10, 1000), 0).unwrap();
        cache.add("a", CacheEntry::new(2, 10, 1000), 1).unwrap();
        let h = cache.get_match("a", 2, |v| *v == 1).unwrap();
        assert_eq!(cache.value(h), Some(&1));
    }

    #[test]
    fn test_get_expired_item_is_removed_and_returns_none() {
        let mut cache = Cache::new(100);
        cache.put("a", CacheEntry::new("v", 10, 5), 0).unwrap();
        assert!(cache.get("a", 10).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_remove_then_get_returns_none() {
        let mut cache = Cache::new(100);
        cache.put("a", CacheEntry::new("v", 10, 1000), 0).unwrap();
        assert_eq!(cache.remove("a"), 1);
        assert!(cache.get("a", 0).is_none());
    }

    #[test]
    fn test_oversized_item_is_rejected() {
        let mut cache = Cache::new(50);
        assert!(cache.put("a", CacheEntry::new("v", 100, 1000), 0).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_eviction_keeps_most_recently_accessed_subset_within_budget() {
        // spec §8 testable property #8: insert 1.5x max, only the most
        // recently accessed subset whose total size <= max remains.
        let mut cache = Cache::new(100);
        for i in 0..15 {
            cache.put(&format!("k{i}"), CacheEntry::new(i, 10, 1_000_000), i as u64).unwrap();
        }
        assert!(cache.size() <= 100);
        assert_eq!(cache.size(), 100);
        // the 5 oldest (k0..k4) should have been evicted first
        for i in 0..5 {
            assert!(cache.get(&format!("k{i}"), 15).is_none(), "k{i} should have been evicted");
        }
        for i in 5..15 {
            assert!(cache.get(&format!("k{i}"), 15).is_some(), "k{i} should remain");
        }
    }

    #[test]
    fn test_lock_defers_destruction_until_unlock() {
        let mut cache = Cache::new(100);
        let h = cache.put("a", CacheEntry::new("v", 10, 1000), 0).unwrap();
        cache.lock(h);
        cache.remove("a");
        // size accounting drops immediately even though destroy is deferred
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.value(h), Some(&"v"), "value survives while locked");
        cache.unlock(h);
        assert_eq!(cache.value(h), None, "destroyed once unlocked");
    }

    #[test]
    fn test_eviction_picks_lru_tail_even_if_locked() {
        let mut cache = Cache::new(20);
        let h1 = cache.put("a", CacheEntry::new("v1", 10, 1000), 0).unwrap();
        cache.lock(h1);
        cache.put("b", CacheEntry::new("v2", 10, 1000), 1).unwrap();
        // inserting a third item forces eviction of the LRU tail ("a"),
        // even though it's locked
        cache.put("c", CacheEntry::new("v3", 10, 1000), 2).unwrap();
        assert_eq!(cache.size(), 20);
        assert_eq!(cache.value(h1), Some(&"v1"), "still readable while locked");
        cache.unlock(h1);
        assert_eq!(cache.value(h1), None);
    }

    #[test]
    fn test_remove_all_match_spans_keys() {
        let mut cache = Cache::new(100);
        cache.put("a", CacheEntry::new(1, 10, 1000), 0).unwrap();
        cache.put("b", CacheEntry::new(2, 10, 1000), 1).unwrap();
        cache.put("c", CacheEntry::new(3, 10, 1000), 2).unwrap();
        let removed = cache.remove_all_match(|v| *v % 2 == 1);
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_flush_drops_everything() {
        let mut cache = Cache::new(100);
        cache.put("a", CacheEntry::new("v", 10, 1000), 0).unwrap();
        cache.put("b", CacheEntry::new("v", 10, 1000), 1).unwrap();
        cache.flush();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_expire_once_sweeps_regardless_of_recency() {
        let mut cache = Cache::new(100);
        cache.put("old", CacheEntry::new("v", 10, 5), 0).unwrap();
        cache.put("new", CacheEntry::new("v", 10, 1000), 1).unwrap();
        let still_has_items = cache.expire_once(10);
        assert!(still_has_items);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("old", 10).is_none());
        assert!(cache.get("new", 10).is_some());
    }

    #[test]
    fn test_expire_once_on_empty_cache_returns_false() {
        let mut cache: Cache<()> = Cache::new(100);
        assert!(!cache.expire_once(0));
    }

    #[test]
    fn test_validate_callback_rejects_item() {
        let mut cache = Cache::new(100).with_validate(|v: &i32| *v != 0);
        cache.put("a", CacheEntry::new(0, 10, 1000), 0).unwrap();
        assert!(cache.get("a", 0).is_none(), "validate() == false evicts like expiry");
    }
}
