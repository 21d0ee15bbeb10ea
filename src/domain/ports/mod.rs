mod build_cache;
mod streamable_storage;

pub use build_cache::BuildCacheInvalidator;
pub use streamable_storage::StreamableStorage;
