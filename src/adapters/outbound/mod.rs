mod dashmap_build_cache;
mod sqlite_kv_storage;

pub use dashmap_build_cache::DashMapBuildCache;
pub use sqlite_kv_storage::{KvEntry, SqliteKvStorage};
