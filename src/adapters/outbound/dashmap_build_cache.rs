//! DashMap Build Cache
//!
//! Implements BuildCacheInvalidator over a concurrent map of compiled
//! pipelines, keyed by pipeline name.

use crate::domain::ports::BuildCacheInvalidator;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory cache of pipeline builds.
pub struct DashMapBuildCache {
    builds: DashMap<String, Arc<Vec<u8>>>,
    invalidations: AtomicU64,
}

impl DashMapBuildCache {
    pub fn new() -> Self {
        Self {
            builds: DashMap::new(),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, pipeline: impl Into<String>, build: Vec<u8>) {
        self.builds.insert(pipeline.into(), Arc::new(build));
    }

    pub fn get(&self, pipeline: &str) -> Option<Arc<Vec<u8>>> {
        self.builds.get(pipeline).map(|b| b.value().clone())
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    /// Number of invalidations applied so far.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl Default for DashMapBuildCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildCacheInvalidator for DashMapBuildCache {
    fn invalidate_all(&self) {
        let dropped = self.builds.len();
        self.builds.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::info!("build cache cleared ({} builds dropped)", dropped);
    }

    fn invalidate(&self, pipeline: &str) {
        if self.builds.remove(pipeline).is_some() {
            tracing::info!("build cache entry {} invalidated", pipeline);
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}
