//! Build Cache Port
//!
//! Target of cluster-wide cache invalidation broadcasts.

/// Cache of compiled log pipelines.
pub trait BuildCacheInvalidator: Send + Sync {
    /// Drop every cached build.
    fn invalidate_all(&self);

    /// Drop the cached build of one pipeline.
    fn invalidate(&self, pipeline: &str);
}
