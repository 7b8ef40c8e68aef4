//! ConcurrentReferenceHashMap: public API over a fixed array of segments.

use crate::config::{MapConfig, MapConfigBuilder};
use crate::error::ConfigError;
use crate::iter::Iter;
use crate::reentrancy::DebugReentrancy;
use crate::reference::ReferenceType;
use crate::segment::{Restructure, Segment};
use crate::task::{Task, TaskKey, TaskOutcome};
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;
use std::sync::Arc;
use tracing::{debug, trace};

/// A segmented concurrent map holding its values through soft or weak
/// references.
///
/// Values are shared as `Arc<V>`. With [`ReferenceType::Weak`] an entry
/// disappears once every `Arc` outside the map is gone; with
/// [`ReferenceType::Soft`] the map keeps values alive until
/// [`reclaim_soft_references`](Self::reclaim_soft_references) signals memory
/// pressure. Reclaimed entries vanish from lookups immediately and are
/// unlinked by the next restructure of their segment, so [`len`](Self::len)
/// is an upper bound on the live entries.
pub struct ConcurrentReferenceHashMap<K, V, S = RandomState> {
    segments: Box<[Segment<K, V>]>,
    shift: u32,
    load_factor: f32,
    reference_type: ReferenceType,
    hasher: S,
}

impl<K, V> ConcurrentReferenceHashMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::from_config(MapConfig::default(), RandomState::new())
    }

    pub fn with_capacity(initial_capacity: usize) -> Self {
        let config = MapConfig {
            initial_capacity,
            ..MapConfig::default()
        };
        Self::from_config(config, RandomState::new())
    }

    pub fn with_reference_type(reference_type: ReferenceType) -> Self {
        let config = MapConfig {
            reference_type,
            ..MapConfig::default()
        };
        Self::from_config(config, RandomState::new())
    }

    pub fn try_with_config(config: MapConfig) -> Result<Self, ConfigError> {
        Self::try_with_config_and_hasher(config, RandomState::new())
    }

    pub fn builder() -> MapConfigBuilder<K, V> {
        MapConfigBuilder::new()
    }
}

impl<K, V> Default for ConcurrentReferenceHashMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentReferenceHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::from_config(MapConfig::default(), hasher)
    }

    pub fn try_with_config_and_hasher(config: MapConfig, hasher: S) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_config(config, hasher))
    }

    // `config` must already be valid.
    fn from_config(config: MapConfig, hasher: S) -> Self {
        let shift = config.segment_shift();
        let segment_size = config.segment_size();
        let reentrancy = DebugReentrancy::new();
        let segments = (0..1usize << shift)
            .map(|_| {
                Segment::new(
                    segment_size,
                    config.load_factor,
                    config.reference_type,
                    reentrancy.clone(),
                )
            })
            .collect();
        debug!(
            segments = 1usize << shift,
            segment_size,
            reference_type = ?config.reference_type,
            "map created"
        );
        Self {
            segments,
            shift,
            load_factor: config.load_factor,
            reference_type: config.reference_type,
            hasher,
        }
    }

    fn hash_of<Q>(&self, key: &Q) -> u32
    where
        Q: ?Sized + Hash,
    {
        let raw = self.hasher.hash_one(key);
        mix((raw ^ (raw >> 32)) as u32)
    }

    /// The top `shift` bits of the hash pick the segment.
    fn segment_for(&self, hash: u32) -> &Segment<K, V> {
        let index = match self.shift {
            0 => 0,
            shift => (hash >> (32 - shift)) as usize,
        };
        &self.segments[index & (self.segments.len() - 1)]
    }

    pub(crate) fn segment(&self, index: usize) -> Option<&Segment<K, V>> {
        self.segments.get(index)
    }

    pub fn segments_len(&self) -> usize {
        self.segments.len()
    }

    pub fn load_factor(&self) -> f32 {
        self.load_factor
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.reference_type
    }

    /// Sum of the segment counts. Includes entries that were reclaimed but
    /// not yet purged.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.count() == 0)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash_of(key);
        self.segment_for(hash)
            .lookup(key, hash, Restructure::WhenNecessary)
    }

    pub fn get_or_default<Q>(&self, key: &Q, default: Arc<V>) -> Arc<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get(key).unwrap_or(default)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get(key).is_some()
    }

    /// Whether `key` is live and currently maps to a value equal to `value`.
    /// Never restructures.
    pub fn contains_entry<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        let hash = self.hash_of(key);
        self.segment_for(hash)
            .lookup(key, hash, Restructure::Never)
            .is_some_and(|current| *current == *value)
    }

    /// Insert or overwrite, returning the previous live value.
    pub fn put(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.put_task(
            key,
            Task::Put {
                value,
                overwrite: true,
            },
        )
        .into_value()
    }

    /// Insert unless a live entry exists; returns the existing value if so.
    pub fn put_if_absent(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.put_task(
            key,
            Task::Put {
                value,
                overwrite: false,
            },
        )
        .into_value()
    }

    /// Return the live value for `key`, inserting `make()` if there is none.
    /// `make` runs under the segment lock and only when inserting; it must
    /// not access this map.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> Arc<V>
    where
        F: FnOnce() -> Arc<V>,
    {
        match self.put_task(key, Task::PutWith(Box::new(make))) {
            TaskOutcome::Current(value) => value,
            TaskOutcome::Value(_) | TaskOutcome::Applied(_) => {
                unreachable!("PutWith yields the current value")
            }
        }
    }

    fn put_task(&self, key: K, task: Task<'_, V>) -> TaskOutcome<V> {
        let hash = self.hash_of(&key);
        self.segment_for(hash)
            .run_task::<K>(hash, TaskKey::Owned(key), task)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash_of(key);
        self.segment_for(hash)
            .run_task(hash, TaskKey::Borrowed(key), Task::Remove)
            .into_value()
    }

    /// Remove `key` only if it currently maps to a value equal to `value`.
    pub fn remove_if_equal<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        let hash = self.hash_of(key);
        let matches = |current: &V| current == value;
        self.segment_for(hash)
            .run_task(hash, TaskKey::Borrowed(key), Task::RemoveIf(&matches))
            .applied()
    }

    /// Replace the value of a live entry, returning the previous one.
    pub fn replace<Q>(&self, key: &Q, value: Arc<V>) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash_of(key);
        self.segment_for(hash)
            .run_task(hash, TaskKey::Borrowed(key), Task::Replace(value))
            .into_value()
    }

    /// Atomically replace the value of `key` if it equals `expected`.
    pub fn replace_if_equal<Q>(&self, key: &Q, expected: &V, value: Arc<V>) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        let hash = self.hash_of(key);
        let matches = |current: &V| current == expected;
        self.segment_for(hash)
            .run_task(
                hash,
                TaskKey::Borrowed(key),
                Task::ReplaceIf {
                    matches: &matches,
                    value,
                },
            )
            .applied()
    }

    /// Empty every segment, one segment lock at a time.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Run a collection cycle and a non-resizing restructure on every
    /// segment, unlinking entries whose values were reclaimed. Useful when
    /// reads vastly outnumber writes.
    pub fn purge_unreferenced_entries(&self) {
        let mut noticed = 0;
        for segment in self.segments.iter() {
            noticed += segment.collect();
            segment.restructure_if_necessary(false);
        }
        trace!(noticed, "purged unreferenced entries");
    }

    /// Signal memory pressure: drop every soft value that only this map
    /// still holds. Returns the number of values reclaimed. The reclaimed
    /// entries keep counting towards [`len`](Self::len) until purged.
    pub fn reclaim_soft_references(&self) -> usize {
        let reclaimed = self.segments.iter().map(Segment::reclaim_soft).sum();
        trace!(reclaimed, "soft references reclaimed");
        reclaimed
    }

    /// Weakly consistent iterator over live entries.
    pub fn iter(&self) -> Iter<'_, K, V, S>
    where
        K: Clone,
    {
        Iter::new(self)
    }
}

impl<'a, K, V, S> IntoIterator for &'a ConcurrentReferenceHashMap<K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    type Item = (K, Arc<V>);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, S> fmt::Debug for ConcurrentReferenceHashMap<K, V, S>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Wang/Jenkins avalanche mix, spreading poor hash distributions over both
/// the segment bits (high) and the bucket bits (low).
fn mix(mut h: u32) -> u32 {
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn mix_spreads_sequential_inputs_over_segments() {
        let top: HashSet<u32> = (0u32..256).map(|i| mix(i) >> 28).collect();
        assert!(top.len() > 8, "top bits should vary, got {top:?}");
        let low: HashSet<u32> = (0u32..256).map(|i| mix(i) & 0xf).collect();
        assert_eq!(low.len(), 16);
    }

    #[test]
    fn segment_count_follows_concurrency_level() {
        let m: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::new();
        assert_eq!(m.segments_len(), 16);
        let m: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::builder()
            .concurrency_level(5)
            .build()
            .unwrap();
        assert_eq!(m.segments_len(), 8);
        let m: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::builder()
            .concurrency_level(usize::MAX)
            .initial_capacity(0)
            .build()
            .unwrap();
        assert_eq!(m.segments_len(), 1 << 16);
    }

    #[test]
    fn keys_land_in_the_segment_their_hash_selects() {
        let m: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::builder()
            .concurrency_level(4)
            .build()
            .unwrap();
        let held: Vec<_> = (0..64).map(|i| (i, Arc::new(i))).collect();
        for (k, v) in &held {
            m.put(*k, Arc::clone(v));
        }
        let mut used = HashSet::new();
        for (k, _) in &held {
            let hash = m.hash_of(k);
            let index = (hash >> 30) as usize;
            assert!(m.segments[index].lookup(k, hash, Restructure::Never).is_some());
            used.insert(index);
        }
        assert!(used.len() > 1, "64 keys should span several segments");
    }

    #[test]
    fn single_segment_uses_whole_hash_for_buckets() {
        let m: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::builder()
            .concurrency_level(1)
            .build()
            .unwrap();
        assert_eq!(m.segments_len(), 1);
        m.put(1, Arc::new(1));
        assert_eq!(m.segments[0].count(), 1);
    }
}
