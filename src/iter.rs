//! Weakly consistent iteration over live entries.
//!
//! The iterator walks segments → bucket chains → chain links. Entering a
//! segment takes a short shared-lock snapshot of its chains (cloned keys and
//! weak value handles), so a resize running concurrently can never make a
//! key show up twice and a pending iterator never keeps soft values alive.
//! No lock is held between calls to `next`. Liveness is checked when an
//! element is about to be yielded; reclaimed references are skipped, never
//! unlinked.

use crate::error::NoCurrentEntry;
use crate::map::ConcurrentReferenceHashMap;
use crate::segment::ChainSnapshot;
use core::hash::{BuildHasher, Hash};
use core::iter::FusedIterator;
use std::collections::hash_map::RandomState;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AdvancingSegment,
    AdvancingBucket,
    AdvancingChain,
    Exhausted,
}

/// Iterator over `(K, Arc<V>)` pairs of a [`ConcurrentReferenceHashMap`].
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a ConcurrentReferenceHashMap<K, V, S>,
    state: State,
    next_segment: usize,
    buckets: std::vec::IntoIter<ChainSnapshot<K, V>>,
    chain: std::vec::IntoIter<(K, Weak<V>)>,
    last: Option<K>,
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'a ConcurrentReferenceHashMap<K, V, S>) -> Self {
        Self {
            map,
            state: State::AdvancingSegment,
            next_segment: 0,
            buckets: Vec::new().into_iter(),
            chain: Vec::new().into_iter(),
            last: None,
        }
    }

    /// Remove the entry most recently returned by `next` from the map.
    ///
    /// Goes through the map's regular locked removal, so a concurrent
    /// writer may already have replaced or removed the entry.
    pub fn remove_current(&mut self) -> Result<(), NoCurrentEntry> {
        let key = self.last.take().ok_or(NoCurrentEntry)?;
        self.map.remove(&key);
        Ok(())
    }
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                State::AdvancingChain => match self.chain.next() {
                    Some((key, value)) => {
                        if let Some(value) = value.upgrade() {
                            self.last = Some(key.clone());
                            return Some((key, value));
                        }
                    }
                    None => self.state = State::AdvancingBucket,
                },
                State::AdvancingBucket => match self.buckets.next() {
                    Some(chain) => {
                        self.chain = chain.into_iter();
                        self.state = State::AdvancingChain;
                    }
                    None => self.state = State::AdvancingSegment,
                },
                State::AdvancingSegment => match self.map.segment(self.next_segment) {
                    Some(segment) => {
                        self.buckets = segment.snapshot().into_iter();
                        self.next_segment += 1;
                        self.state = State::AdvancingBucket;
                    }
                    None => {
                        self.last = None;
                        self.state = State::Exhausted;
                    }
                },
                State::Exhausted => return None,
            }
        }
    }
}

impl<'a, K, V, S> FusedIterator for Iter<'a, K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
}
