//! Named response cache for offline support.
//!
//! This module provides the storage side of the worker:
//! - Stores captured responses keyed by request URL, grouped by cache name
//! - Serves subresources stale-while-revalidate
//! - Backs onto SQLite, or process memory for ephemeral runs

mod layer;
mod storage;
mod traits;

pub use layer::StaleWhileRevalidate;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{request_key, storable, CacheSource, Served};
