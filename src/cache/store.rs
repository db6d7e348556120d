//! On-disk package cache keyed by the client-visible URI path.
//!
//! A request for `/fedora/releases/39/x.rpm` maps to
//! `{base_path}/fedora/releases/39/x.rpm`.  Writes go to a temp file in the
//! target directory and are renamed into place, so readers never observe a
//! partially written package.  There is no locking: two concurrent fills of
//! the same URI both write and the last rename wins.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};

use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("cache I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheStore {
    /// Root directory of the cache (e.g. `/var/cache/pkgproxy`).
    pub base_path: PathBuf,
    registry: Arc<Registry>,
}

impl CacheStore {
    pub fn new(base_path: impl Into<PathBuf>, registry: Arc<Registry>) -> Self {
        Self {
            base_path: base_path.into(),
            registry,
        }
    }

    /// Whether `uri` belongs to a known repository and its filename carries
    /// one of that repository's cacheable suffixes.
    pub fn is_cache_candidate(&self, uri: &str) -> bool {
        self.registry
            .resolve_uri(uri)
            .is_some_and(|repo| repo.is_candidate(uri))
    }

    /// Whether a cached file exists for `uri`.  Directories do not count.
    pub async fn is_cached(&self, uri: &str) -> bool {
        tokio::fs::metadata(self.file_path(uri))
            .await
            .is_ok_and(|meta| meta.is_file())
    }

    /// Return the on-disk path for `uri`.
    pub fn file_path(&self, uri: &str) -> PathBuf {
        self.base_path.join(uri.trim_start_matches('/'))
    }

    /// Persist `payload` as the cache entry for `uri` with its modification
    /// time set to `modified`.  Returns the number of bytes written.
    ///
    /// Blocking; async callers run it on the blocking pool.
    pub fn save_to_disk(
        &self,
        uri: &str,
        payload: &[u8],
        modified: SystemTime,
    ) -> Result<u64, CacheError> {
        let path = self.file_path(uri);
        let parent = path
            .parent()
            .ok_or_else(|| CacheError::io(&path, std::io::ErrorKind::InvalidInput.into()))?;

        std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".pkgproxy-")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| CacheError::io(parent, e))?;
        tmp.write_all(payload)
            .and_then(|()| tmp.flush())
            .map_err(|e| CacheError::io(tmp.path(), e))?;

        // Temp files are created 0600; cached packages should be readable by
        // anything serving the tree directly.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))
                .map_err(|e| CacheError::io(tmp.path(), e))?;
        }

        tmp.as_file()
            .set_modified(modified)
            .map_err(|e| CacheError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| CacheError::io(&path, e.error))?;

        let size = payload.len() as u64;
        info!(path = %path.display(), size, "wrote cache file");
        Ok(size)
    }

    /// Remove the cache entry for `uri`.
    pub async fn delete_file(&self, uri: &str) -> Result<(), CacheError> {
        let path = self.file_path(uri);
        debug!(path = %path.display(), "deleting cache file");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CacheError::NotFound(path)),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }
}
