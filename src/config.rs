//! Construction-time configuration.
//!
//! `MapConfig` carries the four options the map recognises. The values are
//! hints: capacity and concurrency level are rounded up to powers of two and
//! capped, see [`calculate_shift`].

use crate::error::ConfigError;
use crate::map::ConcurrentReferenceHashMap;
use crate::reference::ReferenceType;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;

pub const DEFAULT_INITIAL_CAPACITY: usize = 16;
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

/// Upper bound on the number of segments.
pub const MAXIMUM_CONCURRENCY_LEVEL: usize = 1 << 16;

/// Upper bound on the bucket count of a single segment.
pub const MAXIMUM_SEGMENT_SIZE: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapConfig {
    pub initial_capacity: usize,
    pub load_factor: f32,
    pub concurrency_level: usize,
    pub reference_type: ReferenceType,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            reference_type: ReferenceType::default(),
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.load_factor.is_finite() && self.load_factor > 0.0) {
            return Err(ConfigError::InvalidLoadFactor(self.load_factor));
        }
        if self.concurrency_level == 0 {
            return Err(ConfigError::ZeroConcurrencyLevel);
        }
        Ok(())
    }

    /// Number of bits used to select a segment.
    pub(crate) fn segment_shift(&self) -> u32 {
        calculate_shift(self.concurrency_level, MAXIMUM_CONCURRENCY_LEVEL)
    }

    /// Initial bucket count of each segment.
    pub(crate) fn segment_size(&self) -> usize {
        let segments = 1usize << self.segment_shift();
        let per_segment = self.initial_capacity.div_ceil(segments);
        1usize << calculate_shift(per_segment, MAXIMUM_SEGMENT_SIZE)
    }
}

/// Smallest `shift` such that `1 << shift >= minimum`, capped so that
/// `1 << shift <= maximum`.
pub(crate) fn calculate_shift(minimum: usize, maximum: usize) -> u32 {
    let mut shift = 0;
    let mut value = 1usize;
    while value < minimum && value < maximum {
        value <<= 1;
        shift += 1;
    }
    shift
}

/// Resize trigger for a segment of `size` buckets.
pub(crate) fn resize_threshold(size: usize, load_factor: f32) -> usize {
    (size as f64 * load_factor as f64) as usize
}

/// Builder for [`MapConfig`] and the map it configures; obtained from
/// [`ConcurrentReferenceHashMap::builder`](crate::ConcurrentReferenceHashMap::builder).
/// `K` and `V` name the map being built, usually inferred from the binding.
pub struct MapConfigBuilder<K, V> {
    config: MapConfig,
    _map: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for MapConfigBuilder<K, V> {
    fn default() -> Self {
        Self {
            config: MapConfig::default(),
            _map: PhantomData,
        }
    }
}

impl<K, V> Clone for MapConfigBuilder<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            _map: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for MapConfigBuilder<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl<K, V> MapConfigBuilder<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_capacity = capacity;
        self
    }

    pub fn load_factor(mut self, load_factor: f32) -> Self {
        self.config.load_factor = load_factor;
        self
    }

    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.config.concurrency_level = level;
        self
    }

    pub fn reference_type(mut self, reference_type: ReferenceType) -> Self {
        self.config.reference_type = reference_type;
        self
    }

    /// Validate and return the configuration.
    pub fn config(self) -> Result<MapConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Validate and build a map using the default hasher.
    pub fn build(self) -> Result<ConcurrentReferenceHashMap<K, V>, ConfigError>
    where
        K: Eq + Hash,
    {
        ConcurrentReferenceHashMap::try_with_config(self.config)
    }

    /// Validate and build a map using `hasher`.
    pub fn build_with_hasher<S>(
        self,
        hasher: S,
    ) -> Result<ConcurrentReferenceHashMap<K, V, S>, ConfigError>
    where
        K: Eq + Hash,
        S: BuildHasher,
    {
        ConcurrentReferenceHashMap::try_with_config_and_hasher(self.config, hasher)
    }
}
