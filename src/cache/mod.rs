//! Offline cache for an app shell and the requests around it.
//!
//! This module provides:
//! - Versioned, named cache stores (one per cache generation)
//! - An install/activate lifecycle that populates and purges those stores
//! - Stale-while-revalidate serving for intercepted GET requests
//! - A bypass for dynamic endpoints that are never cached

mod manager;
mod registration;
mod storage;
mod traits;

pub use manager::{CacheManager, FetchOutcome, ManagerConfig};
pub use storage::{CacheStorage, SqliteStorage};
