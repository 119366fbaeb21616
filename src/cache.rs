//! In-process cache of built indexes, keyed by document path and content.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::{error::Result, index::VectorIndex};

#[derive(Debug)]
struct CachedIndex {
    content_hash: blake3::Hash,
    index: Arc<VectorIndex>,
}

/// Built indexes, one per document path.
///
/// An entry is reused only while the document's content hash is unchanged.
/// Indexes are built outside the lock and swapped in whole, so a concurrent
/// reader sees either the previous index or the new one. A failed build
/// leaves the existing entry in place.
///
/// The cache does not know how its indexes were built; a cache must only be
/// shared between callers using the same embedder and chunking settings.
#[derive(Debug, Default)]
pub struct IndexCache {
    entries: RwLock<HashMap<PathBuf, CachedIndex>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached index for `path` if it was built from content with
    /// `content_hash`, otherwise run `build` and cache its result.
    pub fn get_or_build<F>(
        &self,
        path: &Path,
        content_hash: blake3::Hash,
        build: F,
    ) -> Result<Arc<VectorIndex>>
    where
        F: FnOnce() -> Result<VectorIndex>,
    {
        if let Some(index) = self.lookup(path, &content_hash) {
            debug!(path = %path.display(), "index cache hit");
            return Ok(index);
        }

        debug!(path = %path.display(), "index cache miss, building");
        let index = Arc::new(build()?);

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            path.to_path_buf(),
            CachedIndex {
                content_hash,
                index: Arc::clone(&index),
            },
        );
        Ok(index)
    }

    fn lookup(
        &self,
        path: &Path,
        content_hash: &blake3::Hash,
    ) -> Option<Arc<VectorIndex>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(path)
            .filter(|entry| entry.content_hash == *content_hash)
            .map(|entry| Arc::clone(&entry.index))
    }

    /// Drop the entry for `path`. Returns whether one existed.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(path)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
