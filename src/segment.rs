//! Segment: an independently locked shard of the map.
//!
//! A segment owns a power-of-two array of bucket heads and a slot arena of
//! `Reference`s chained through their `next` keys. Reads take the shared
//! side of the segment's `RwLock`; tasks and restructures take the
//! exclusive side. `count` and the resize threshold are atomics so that the
//! "is a restructure worth it" checks and `len()` never lock.
//!
//! Invariants
//! - Every slot in the arena is linked into exactly one bucket chain.
//! - `count == slots.len()` whenever the lock is free. Released and
//!   reclaimed references stay in the arena (and in `count`) until the next
//!   restructure, so `count` is an upper bound on live entries.
//! - The bucket array only grows, by doubling.

use crate::config::{resize_threshold, MAXIMUM_SEGMENT_SIZE};
use crate::reentrancy::DebugReentrancy;
use crate::reference::{Reference, ReferenceManager, ReferenceType, SlotKey};
use crate::task::{Task, TaskKey, TaskOutcome};
use core::borrow::Borrow;
use hashbrown::HashSet;
use parking_lot::RwLock;
use slotmap::SlotMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Whether a lookup may restructure the segment first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Restructure {
    WhenNecessary,
    /// Used where the caller relies on structural stability.
    Never,
}

/// Snapshot of one bucket chain, taken for iteration. Values are held
/// weakly so an in-flight iterator never blocks soft reclamation.
pub(crate) type ChainSnapshot<K, V> = Vec<(K, Weak<V>)>;

pub(crate) struct Table<K, V> {
    buckets: Vec<Option<SlotKey>>,
    slots: SlotMap<SlotKey, Reference<K, V>>,
}

impl<K, V> Table<K, V> {
    fn with_size(size: usize) -> Self {
        Self {
            buckets: vec![None; size],
            slots: SlotMap::with_key(),
        }
    }

    #[inline]
    fn index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    /// First live reference matching `hash` and `key`. Dead references met
    /// on the way are handed to the purge queue.
    fn find_in_chain<Q>(
        &self,
        hash: u32,
        key: &Q,
        manager: &ReferenceManager,
    ) -> Option<(SlotKey, Arc<V>)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let mut cur = self.buckets[self.index(hash)];
        while let Some(k) = cur {
            let r = self.slots.get(k)?;
            if r.hash() == hash {
                match r.get() {
                    Some(value) => {
                        if r.key().borrow() == key {
                            return Some((k, value));
                        }
                    }
                    None => r.notice_collected(k, manager),
                }
            }
            cur = r.next();
        }
        None
    }

    /// Rebuild every chain into `new_len` buckets, keeping the references
    /// accepted by `keep` and returning the rest.
    fn relink(
        &mut self,
        new_len: usize,
        mut keep: impl FnMut(SlotKey, &Reference<K, V>) -> bool,
    ) -> Vec<Reference<K, V>> {
        let old = core::mem::replace(&mut self.buckets, vec![None; new_len]);
        let mask = new_len - 1;
        let mut purged = Vec::new();
        for head in old {
            let mut cur = head;
            while let Some(k) = cur {
                let Some(r) = self.slots.get_mut(k) else {
                    break;
                };
                cur = r.next();
                if keep(k, r) {
                    let idx = r.hash() as usize & mask;
                    r.set_next(self.buckets[idx]);
                    self.buckets[idx] = Some(k);
                } else if let Some(r) = self.slots.remove(k) {
                    purged.push(r);
                }
            }
        }
        purged
    }
}

/// Exclusive view of one bucket chain handed to a task: the located live
/// entry (if any) and the capability to insert a new one.
pub(crate) struct LockedChain<'a, K, V> {
    table: &'a mut Table<K, V>,
    manager: &'a ReferenceManager,
    count: &'a AtomicUsize,
    index: usize,
    hash: u32,
    found: Option<(SlotKey, Arc<V>)>,
}

impl<'a, K, V> LockedChain<'a, K, V> {
    pub(crate) fn current(&self) -> Option<&Arc<V>> {
        self.found.as_ref().map(|(_, v)| v)
    }

    pub(crate) fn set_value(&mut self, value: &Arc<V>) -> Option<Arc<V>> {
        let (k, _) = self.found.as_ref()?;
        self.table.slots.get_mut(*k)?.set_value(value)
    }

    pub(crate) fn release(&mut self) -> Option<Arc<V>> {
        let (k, _) = self.found.take()?;
        self.table.slots.get_mut(k)?.release(k, self.manager)
    }

    /// Link a new reference at the head of the chain.
    pub(crate) fn add(&mut self, key: K, value: &Arc<V>) {
        let head = self.table.buckets[self.index];
        let reference = self.manager.create_reference(key, value, self.hash, head);
        let k = self.table.slots.insert(reference);
        self.table.buckets[self.index] = Some(k);
        self.count.store(self.table.slots.len(), Ordering::Release);
        self.found = Some((k, Arc::clone(value)));
    }
}

pub(crate) struct Segment<K, V> {
    table: RwLock<Table<K, V>>,
    manager: ReferenceManager,
    count: AtomicUsize,
    resize_threshold: AtomicUsize,
    initial_size: usize,
    load_factor: f32,
    reentrancy: DebugReentrancy,
}

impl<K, V> Segment<K, V> {
    pub(crate) fn new(
        initial_size: usize,
        load_factor: f32,
        reference_type: ReferenceType,
        reentrancy: DebugReentrancy,
    ) -> Self {
        Self {
            table: RwLock::new(Table::with_size(initial_size)),
            manager: ReferenceManager::new(reference_type),
            count: AtomicUsize::new(0),
            resize_threshold: AtomicUsize::new(resize_threshold(initial_size, load_factor)),
            initial_size,
            load_factor,
            reentrancy,
        }
    }

    /// Live plus not-yet-purged references.
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn bucket_len(&self) -> usize {
        let _g = self.reentrancy.enter();
        self.table.read().buckets.len()
    }

    pub(crate) fn lookup<Q>(&self, key: &Q, hash: u32, policy: Restructure) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        if policy == Restructure::WhenNecessary {
            self.restructure_if_necessary(false);
        }
        if self.count() == 0 {
            return None;
        }
        let _g = self.reentrancy.enter();
        let table = self.table.read();
        table
            .find_in_chain(hash, key, &self.manager)
            .map(|(_, value)| value)
    }

    pub(crate) fn run_task<Q>(
        &self,
        hash: u32,
        key: TaskKey<'_, K, Q>,
        task: Task<'_, V>,
    ) -> TaskOutcome<V>
    where
        K: Borrow<Q> + Eq,
        Q: ?Sized + Eq,
    {
        let options = task.options();
        if options.restructure_before {
            self.restructure_if_necessary(options.resize);
        }
        if options.skip_if_empty && self.count() == 0 {
            return task.execute::<K>(None, None);
        }

        let outcome = {
            let _g = self.reentrancy.enter();
            let mut table = self.table.write();
            let found = match &key {
                TaskKey::Owned(k) => table.find_in_chain::<K>(hash, k, &self.manager),
                TaskKey::Borrowed(q) => table.find_in_chain(hash, *q, &self.manager),
            };
            let index = table.index(hash);
            let mut chain = LockedChain {
                table: &mut *table,
                manager: &self.manager,
                count: &self.count,
                index,
                hash,
                found,
            };
            let key = match key {
                TaskKey::Owned(k) => Some(k),
                TaskKey::Borrowed(_) => None,
            };
            task.execute(Some(&mut chain), key)
        };

        if options.restructure_after {
            self.restructure_if_necessary(options.resize);
        }
        outcome
    }

    /// Restructure when something is waiting to be purged or, if allowed,
    /// when the count has reached the resize threshold.
    pub(crate) fn restructure_if_necessary(&self, allow_resize: bool) {
        let count = self.count();
        let needs_resize =
            allow_resize && count > 0 && count >= self.resize_threshold.load(Ordering::Acquire);
        if self.manager.has_pending() || needs_resize {
            self.restructure(allow_resize);
        }
    }

    fn restructure(&self, allow_resize: bool) {
        let purged = {
            let _g = self.reentrancy.enter();
            let mut table = self.table.write();

            let mut to_purge: HashSet<SlotKey> = HashSet::new();
            while let Some(k) = self.manager.poll_for_purge() {
                if table.slots.contains_key(k) {
                    to_purge.insert(k);
                }
            }
            let surviving = table
                .slots
                .iter()
                .filter(|(k, r)| r.is_alive() && !to_purge.contains(k))
                .count();

            let len = table.buckets.len();
            let threshold = self.resize_threshold.load(Ordering::Acquire);
            let resizing = allow_resize
                && surviving > 0
                && surviving >= threshold
                && len < MAXIMUM_SEGMENT_SIZE;
            let new_len = if resizing { len << 1 } else { len };

            let purged = table.relink(new_len, |k, r| r.is_alive() && !to_purge.contains(&k));
            if resizing {
                let threshold = resize_threshold(new_len, self.load_factor);
                self.resize_threshold.store(threshold, Ordering::Release);
                debug!(from = len, to = new_len, threshold, "segment resized");
            }
            self.count.store(table.slots.len(), Ordering::Release);
            trace!(purged = purged.len(), live = table.slots.len(), "segment restructured");
            purged
        };
        // Keys and values are dropped with the lock released.
        drop(purged);
    }

    /// Collection cycle: hand every dead reference to the purge queue.
    pub(crate) fn collect(&self) -> usize {
        let _g = self.reentrancy.enter();
        let table = self.table.read();
        let mut noticed = 0;
        for (k, r) in table.slots.iter() {
            if !r.is_alive() {
                r.notice_collected(k, &self.manager);
                noticed += 1;
            }
        }
        noticed
    }

    /// Clear soft references the map holds exclusively. The cleared
    /// references stay counted until the next restructure.
    pub(crate) fn reclaim_soft(&self) -> usize {
        let reclaimed: Vec<Arc<V>> = {
            let _g = self.reentrancy.enter();
            let mut table = self.table.write();
            let manager = &self.manager;
            table
                .slots
                .iter_mut()
                .filter_map(|(k, r)| r.reclaim_soft(k, manager))
                .collect()
        };
        reclaimed.len()
    }

    pub(crate) fn clear(&self) {
        let dropped = {
            let _g = self.reentrancy.enter();
            let mut table = self.table.write();
            let dropped: Vec<Reference<K, V>> = table.slots.drain().map(|(_, r)| r).collect();
            table.buckets = vec![None; self.initial_size];
            self.manager.drain();
            self.resize_threshold.store(
                resize_threshold(self.initial_size, self.load_factor),
                Ordering::Release,
            );
            self.count.store(0, Ordering::Release);
            dropped
        };
        drop(dropped);
    }

    /// Copy out every chain that still holds a reference, in bucket order.
    pub(crate) fn snapshot(&self) -> Vec<ChainSnapshot<K, V>>
    where
        K: Clone,
    {
        if self.count() == 0 {
            return Vec::new();
        }
        let _g = self.reentrancy.enter();
        let table = self.table.read();
        let mut chains = Vec::new();
        for head in table.buckets.iter() {
            let mut chain = Vec::new();
            let mut cur = *head;
            while let Some(k) = cur {
                let Some(r) = table.slots.get(k) else {
                    break;
                };
                if r.is_alive() {
                    chain.push((r.key().clone(), r.downgrade()));
                }
                cur = r.next();
            }
            if !chain.is_empty() {
                chains.push(chain);
            }
        }
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(size: usize, reference_type: ReferenceType) -> Segment<String, i32> {
        Segment::new(size, 0.75, reference_type, DebugReentrancy::new())
    }

    fn put(s: &Segment<String, i32>, hash: u32, key: &str, value: &Arc<i32>) -> Option<Arc<i32>> {
        s.run_task::<String>(
            hash,
            TaskKey::Owned(key.to_string()),
            Task::Put {
                value: Arc::clone(value),
                overwrite: true,
            },
        )
        .into_value()
    }

    fn remove(s: &Segment<String, i32>, hash: u32, key: &str) -> Option<Arc<i32>> {
        s.run_task(hash, TaskKey::Borrowed(key), Task::Remove)
            .into_value()
    }

    #[test]
    fn put_then_lookup_by_hash_and_key() {
        let s = segment(4, ReferenceType::Soft);
        let v = Arc::new(1);
        assert!(put(&s, 9, "a", &v).is_none());
        assert_eq!(s.lookup("a", 9, Restructure::Never).as_deref(), Some(&1));
        // Same key, other hash: not found.
        assert!(s.lookup("a", 10, Restructure::Never).is_none());
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn colliding_hashes_share_a_chain() {
        let s = segment(2, ReferenceType::Soft);
        let (a, b) = (Arc::new(1), Arc::new(2));
        put(&s, 5, "a", &a);
        put(&s, 5, "b", &b);
        assert_eq!(s.lookup("a", 5, Restructure::Never).as_deref(), Some(&1));
        assert_eq!(s.lookup("b", 5, Restructure::Never).as_deref(), Some(&2));
        assert_eq!(s.snapshot().len(), 1, "both entries in one bucket");
    }

    #[test]
    fn overwrite_keeps_one_entry_per_key() {
        let s = segment(4, ReferenceType::Soft);
        put(&s, 1, "k", &Arc::new(1));
        let previous = put(&s, 1, "k", &Arc::new(2));
        assert_eq!(previous.as_deref(), Some(&1));
        assert_eq!(s.count(), 1);
        assert_eq!(s.lookup("k", 1, Restructure::Never).as_deref(), Some(&2));
    }

    #[test]
    fn remove_releases_then_restructure_purges() {
        let s = segment(4, ReferenceType::Soft);
        put(&s, 3, "k", &Arc::new(7));
        assert_eq!(remove(&s, 3, "k").as_deref(), Some(&7));
        // Released and purged by the restructure that follows the task.
        assert_eq!(s.count(), 0);
        assert!(s.lookup("k", 3, Restructure::Never).is_none());
        assert!(remove(&s, 3, "k").is_none());
    }

    #[test]
    fn resize_doubles_and_keeps_entries() {
        let s = segment(4, ReferenceType::Soft);
        let values: Vec<Arc<i32>> = (0..16).map(Arc::new).collect();
        for (i, v) in values.iter().enumerate() {
            put(&s, i as u32, &format!("k{i}"), v);
        }
        assert!(s.bucket_len() >= 16);
        assert!(s.bucket_len().is_power_of_two());
        for i in 0..16i32 {
            let got = s.lookup(format!("k{i}").as_str(), i as u32, Restructure::Never);
            assert_eq!(got.as_deref(), Some(&i));
        }
        assert_eq!(s.count(), 16);
    }

    #[test]
    fn resize_never_shrinks() {
        let s = segment(2, ReferenceType::Soft);
        for i in 0..8 {
            put(&s, i, &format!("k{i}"), &Arc::new(i as i32));
        }
        let grown = s.bucket_len();
        for i in 0..8 {
            remove(&s, i, &format!("k{i}"));
        }
        s.restructure(true);
        assert_eq!(s.bucket_len(), grown);
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn dead_weak_reference_counts_until_restructure() {
        let s = segment(4, ReferenceType::Weak);
        let v = Arc::new(1);
        put(&s, 2, "k", &v);
        drop(v);
        assert_eq!(s.count(), 1, "collected but not purged");
        assert!(s.lookup("k", 2, Restructure::Never).is_none());
        // The lookup noticed the dead reference; the next one purges it.
        assert!(s.lookup("k", 2, Restructure::WhenNecessary).is_none());
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn collect_finds_unnoticed_dead_references() {
        let s = segment(4, ReferenceType::Weak);
        let keep = Arc::new(1);
        put(&s, 1, "keep", &keep);
        put(&s, 2, "drop", &Arc::new(2));
        assert_eq!(s.count(), 2);
        assert_eq!(s.collect(), 1);
        s.restructure_if_necessary(false);
        assert_eq!(s.count(), 1);
        assert_eq!(s.lookup("keep", 1, Restructure::Never).as_deref(), Some(&1));
    }

    #[test]
    fn reclaim_soft_clears_exclusive_values_only() {
        let s = segment(4, ReferenceType::Soft);
        let held = Arc::new(1);
        put(&s, 1, "held", &held);
        put(&s, 2, "only-map", &Arc::new(2));
        assert_eq!(s.reclaim_soft(), 1);
        assert_eq!(s.count(), 2, "reclaimed but not purged");
        assert!(s.lookup("only-map", 2, Restructure::Never).is_none());
        s.restructure_if_necessary(false);
        assert_eq!(s.count(), 1);
        assert!(s.lookup("held", 1, Restructure::Never).is_some());
    }

    #[test]
    fn clear_resets_size_and_queue() {
        let s = segment(2, ReferenceType::Soft);
        for i in 0..8 {
            put(&s, i, &format!("k{i}"), &Arc::new(i as i32));
        }
        remove(&s, 0, "k0");
        s.clear();
        assert_eq!(s.count(), 0);
        assert_eq!(s.bucket_len(), 2);
        assert!(s.snapshot().is_empty());
        assert!(!s.manager.has_pending());
        put(&s, 1, "k1", &Arc::new(1));
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn empty_segment_skips_locked_removal() {
        let s = segment(2, ReferenceType::Soft);
        assert!(remove(&s, 0, "missing").is_none());
        let any = |_: &i32| true;
        let out = s.run_task(0, TaskKey::Borrowed("missing"), Task::RemoveIf(&any));
        assert!(!out.applied());
    }

    #[test]
    fn stale_purge_keys_are_ignored() {
        let s = segment(4, ReferenceType::Soft);
        put(&s, 1, "a", &Arc::new(1));
        remove(&s, 1, "a");
        // Slot was freed; reinsertion may reuse it with a new generation.
        put(&s, 1, "b", &Arc::new(2));
        s.restructure(false);
        assert_eq!(s.lookup("b", 1, Restructure::Never).as_deref(), Some(&2));
    }
}
