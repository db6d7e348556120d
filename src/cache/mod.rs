//! Local package cache.
//!
//! Provides a [`CacheStore`] that owns the on-disk file tree mirroring the
//! public URL layout (`{base_path}/{handle}/{upstream-path}`).  Entries are
//! only created by a cache fill and only removed by an explicit `DELETE`.

pub mod store;

pub use store::{CacheError, CacheStore};
