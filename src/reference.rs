//! References: reclaimable handles to map entries, and the per-segment
//! manager that creates them and collects the ones ready for purging.
//!
//! A `Reference` lives in a segment's slot arena and is named by a
//! generational `SlotKey`. Chains are formed through `next` keys. The value
//! held by the entry is either a `Weak<V>` (dies with the last external
//! `Arc`) or an `Arc<V>` that can be cleared under memory pressure (soft).
//! Once reclaimed or released, `get` yields `None` forever; the slot itself
//! stays linked until the segment restructures.

use crossbeam_queue::SegQueue;
use slotmap::DefaultKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Generational key of a reference inside its segment's arena.
pub(crate) type SlotKey = DefaultKey;

/// Strength of the references a map holds to its values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    /// The map keeps values alive until memory pressure is signalled with
    /// [`reclaim_soft_references`](crate::ConcurrentReferenceHashMap::reclaim_soft_references)
    /// and nobody else holds them.
    #[default]
    Soft,
    /// The map never keeps values alive; an entry dies with the last
    /// external `Arc`.
    Weak,
}

enum ValueRef<V> {
    Soft(Arc<V>),
    Weak(Weak<V>),
    Cleared,
}

impl<V> ValueRef<V> {
    fn new(value: &Arc<V>, reference_type: ReferenceType) -> Self {
        match reference_type {
            ReferenceType::Soft => ValueRef::Soft(Arc::clone(value)),
            ReferenceType::Weak => ValueRef::Weak(Arc::downgrade(value)),
        }
    }

    fn get(&self) -> Option<Arc<V>> {
        match self {
            ValueRef::Soft(v) => Some(Arc::clone(v)),
            ValueRef::Weak(w) => w.upgrade(),
            ValueRef::Cleared => None,
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            ValueRef::Soft(_) => true,
            ValueRef::Weak(w) => w.strong_count() > 0,
            ValueRef::Cleared => false,
        }
    }
}

/// Key plus mutable value slot.
pub(crate) struct Entry<K, V> {
    key: K,
    value: ValueRef<V>,
}

pub(crate) struct Reference<K, V> {
    entry: Entry<K, V>,
    hash: u32,
    next: Option<SlotKey>,
    reference_type: ReferenceType,
    // Set once the reference has been pushed onto the purge queue.
    enqueued: AtomicBool,
}

impl<K, V> Reference<K, V> {
    /// The current value, or `None` once reclaimed or released.
    pub(crate) fn get(&self) -> Option<Arc<V>> {
        self.entry.value.get()
    }

    pub(crate) fn key(&self) -> &K {
        &self.entry.key
    }

    /// A non-owning handle to the current value; dangling once cleared.
    /// Soft values are not kept alive through it.
    pub(crate) fn downgrade(&self) -> Weak<V> {
        match &self.entry.value {
            ValueRef::Soft(v) => Arc::downgrade(v),
            ValueRef::Weak(w) => Weak::clone(w),
            ValueRef::Cleared => Weak::new(),
        }
    }

    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }

    pub(crate) fn next(&self) -> Option<SlotKey> {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Option<SlotKey>) {
        self.next = next;
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.entry.value.is_alive()
    }

    /// Store a new value, returning the previous one if it was still alive.
    pub(crate) fn set_value(&mut self, value: &Arc<V>) -> Option<Arc<V>> {
        let previous = core::mem::replace(
            &mut self.entry.value,
            ValueRef::new(value, self.reference_type),
        );
        previous.get()
    }

    /// Invalidate this reference and hand it to the purge queue.
    pub(crate) fn release(&mut self, key: SlotKey, manager: &ReferenceManager) -> Option<Arc<V>> {
        let previous = core::mem::replace(&mut self.entry.value, ValueRef::Cleared);
        self.notice_collected(key, manager);
        previous.get()
    }

    /// Drop a soft value the map holds exclusively. Returns the value so the
    /// caller can dispose of it outside the segment lock.
    pub(crate) fn reclaim_soft(
        &mut self,
        key: SlotKey,
        manager: &ReferenceManager,
    ) -> Option<Arc<V>> {
        let exclusive = matches!(&self.entry.value, ValueRef::Soft(v) if Arc::strong_count(v) == 1);
        if !exclusive {
            return None;
        }
        match core::mem::replace(&mut self.entry.value, ValueRef::Cleared) {
            ValueRef::Soft(v) => {
                self.notice_collected(key, manager);
                Some(v)
            }
            _ => None,
        }
    }

    /// Enqueue for purging, at most once per reference.
    pub(crate) fn notice_collected(&self, key: SlotKey, manager: &ReferenceManager) {
        if !self.enqueued.swap(true, Ordering::AcqRel) {
            manager.enqueue(key);
        }
    }
}

/// Creates references of one strength and owns the purge queue they are
/// handed to once reclaimed.
pub(crate) struct ReferenceManager {
    reference_type: ReferenceType,
    queue: SegQueue<SlotKey>,
}

impl ReferenceManager {
    pub(crate) fn new(reference_type: ReferenceType) -> Self {
        Self {
            reference_type,
            queue: SegQueue::new(),
        }
    }

    pub(crate) fn create_reference<K, V>(
        &self,
        key: K,
        value: &Arc<V>,
        hash: u32,
        next: Option<SlotKey>,
    ) -> Reference<K, V> {
        Reference {
            entry: Entry {
                key,
                value: ValueRef::new(value, self.reference_type),
            },
            hash,
            next,
            reference_type: self.reference_type,
            enqueued: AtomicBool::new(false),
        }
    }

    /// Next reference waiting to be purged, if any. Keys may be stale.
    pub(crate) fn poll_for_purge(&self) -> Option<SlotKey> {
        self.queue.pop()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub(crate) fn drain(&self) {
        while self.queue.pop().is_some() {}
    }

    fn enqueue(&self, key: SlotKey) {
        self.queue.push(key);
    }
}
