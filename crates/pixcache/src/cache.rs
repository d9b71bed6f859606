//! Image cache with cost-aware LRU eviction
//!
//! Caches decoded rasters by (source, scale constraint) under a byte
//! budget. Eviction runs after every insert until the budget holds again,
//! which may throw out the entry that was just inserted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::decoder::DecodedImage;

/// Cache key derived from an image source and its scaling constraint
///
/// Two requests for the same path under the same bound always produce an
/// equal key, so the key doubles as the staleness marker for display
/// targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    /// Source file path
    pub source: PathBuf,
    /// Maximum width or height; `None` decodes at full resolution
    pub max_size: Option<u32>,
}

impl ImageKey {
    /// Create a key for a bounded or unbounded load
    pub fn new(source: impl Into<PathBuf>, max_size: Option<u32>) -> Self {
        Self {
            source: source.into(),
            max_size,
        }
    }

    /// Create a key for a full-resolution load
    pub fn original(source: impl Into<PathBuf>) -> Self {
        Self::new(source, None)
    }

    /// Source path this key was derived from
    pub fn source(&self) -> &Path {
        &self.source
    }
}

struct CacheEntry {
    image: Arc<DecodedImage>,
    last_access: u64,
}

/// LRU image cache bounded by total pixel bytes
///
/// Single-threaded by design; [`crate::ImageLoader`] wraps it in a mutex
/// and never holds that lock across a decode.
pub struct ImageCache {
    entries: HashMap<ImageKey, CacheEntry>,
    /// Maximum total raster bytes
    max_memory: usize,
    /// Current total raster bytes
    current_memory: usize,
    /// Monotonic stamp; every get/put bumps it
    access_counter: u64,
    hits: u64,
    misses: u64,
}

impl ImageCache {
    /// Create a new cache with a byte budget
    pub fn new(max_memory: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_memory,
            current_memory: 0,
            access_counter: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Get an image, refreshing its recency
    pub fn get(&mut self, key: &ImageKey) -> Option<Arc<DecodedImage>> {
        self.access_counter += 1;

        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access = self.access_counter;
            self.hits += 1;
            Some(Arc::clone(&entry.image))
        } else {
            self.misses += 1;
            None
        }
    }

    /// Whether the key is present, without touching recency or stats
    pub fn contains(&self, key: &ImageKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an image, then evict until the budget holds
    ///
    /// An image costing more than the whole budget is accepted and
    /// immediately evicted again once everything older is gone.
    pub fn put(&mut self, key: ImageKey, image: Arc<DecodedImage>) {
        let size = image.memory_size();
        self.access_counter += 1;

        let entry = CacheEntry {
            image,
            last_access: self.access_counter,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.current_memory -= old.image.memory_size();
        }
        self.current_memory += size;

        while self.current_memory > self.max_memory && !self.entries.is_empty() {
            self.evict_lru();
        }
    }

    /// Evict the entry with the oldest access stamp
    fn evict_lru(&mut self) {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());

        if let Some(key) = lru_key {
            if let Some(entry) = self.entries.remove(&key) {
                self.current_memory -= entry.image.memory_size();
                debug!(
                    source = %key.source.display(),
                    bytes = entry.image.memory_size(),
                    "evicted image"
                );
            }
        }
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_memory = 0;
    }

    /// Number of cached images
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current raster bytes held
    pub fn memory_usage(&self) -> usize {
        self.current_memory
    }

    /// Configured byte budget
    pub fn capacity(&self) -> usize {
        self.max_memory
    }

    /// Counters snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            memory_usage: self.current_memory,
            capacity: self.max_memory,
            hits: self.hits,
            misses: self.misses,
        }
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("entries", &self.entries.len())
            .field("memory_usage", &self.current_memory)
            .field("capacity", &self.max_memory)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_usage: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
