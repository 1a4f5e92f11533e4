//! Blob cache collaborator interface.
//!
//! The on-disk asset cache is an external component with its own I/O
//! pool; the pipeline talks to it through [`BlobCache`]. Reads return a
//! byte prefix plus what the cache believes the full file size to be;
//! writes hand back the accumulated prefix together with a size field the
//! cache persists verbatim.
//!
//! The legacy cache encodes "file not fully present" as a stored size of
//! `len + 1`. Internally this crate keeps the honest `Option<usize>` and
//! converts at the boundary via [`stored_file_size`] and
//! [`known_file_size`].

use crate::asset::AssetId;
use bytes::Bytes;
use std::future::Future;
use std::path::Path;
use thiserror::Error;

/// A successful cache read.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The bytes read, starting at the requested offset.
    pub bytes: Bytes,
    /// Total size of the asset if the cache holds it completely.
    pub file_size: Option<usize>,
    /// True when the entry came from a read-only local store that must
    /// never be evicted or rewritten.
    pub local: bool,
}

/// Errors reported by the cache collaborator.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Underlying I/O failure.
    #[error("cache I/O error: {0}")]
    Io(String),

    /// The entry exists but its on-disk form is damaged.
    #[error("cache entry corrupt: {0}")]
    Corrupt(String),
}

/// Interface to the external blob cache.
///
/// All calls complete asynchronously on the cache's own pool. A read that
/// finds nothing is `Ok(None)`, not an error; errors mean the cache
/// itself misbehaved.
pub trait BlobCache: Send + Sync + 'static {
    /// Reads up to `size` bytes of asset `id` starting at `offset`.
    fn read(
        &self,
        id: AssetId,
        offset: usize,
        size: usize,
    ) -> impl Future<Output = Result<Option<CacheHit>, CacheError>> + Send;

    /// Reads from a local file instead of the cache proper. Used for
    /// `file://` assets; entries read this way report `local = true`.
    fn read_local(
        &self,
        path: &Path,
        offset: usize,
        size: usize,
    ) -> impl Future<Output = Result<Option<CacheHit>, CacheError>> + Send;

    /// Writes the accumulated prefix of asset `id`. `file_size` is stored
    /// verbatim; see [`stored_file_size`] for the sentinel convention.
    fn write(
        &self,
        id: AssetId,
        data: Bytes,
        file_size: usize,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Drops asset `id` from the cache, if present.
    fn remove(&self, id: AssetId) -> impl Future<Output = ()> + Send;

    /// Asks the cache to move a pending write for `id` to the front of
    /// its queue. Advisory; may be a no-op.
    fn prioritize_write(&self, id: AssetId);
}

/// Size field to hand the cache for a prefix of `len` bytes.
///
/// `len` when the prefix is the whole file, `len + 1` otherwise (the
/// sentinel the legacy cache format expects).
#[inline]
pub fn stored_file_size(len: usize, have_all: bool) -> usize {
    if have_all {
        len
    } else {
        len + 1
    }
}

/// Inverse of [`stored_file_size`]: interprets a stored size field read
/// back from the cache for a prefix of `len` bytes.
#[inline]
pub fn known_file_size(stored: usize, len: usize) -> Option<usize> {
    if stored > 0 && len >= stored {
        Some(stored)
    } else {
        None
    }
}

/// Cache that stores nothing. Every read misses, every write succeeds.
#[derive(Debug, Clone, Default)]
pub struct NoOpBlobCache;

impl BlobCache for NoOpBlobCache {
    async fn read(
        &self,
        _id: AssetId,
        _offset: usize,
        _size: usize,
    ) -> Result<Option<CacheHit>, CacheError> {
        Ok(None)
    }

    async fn read_local(
        &self,
        _path: &Path,
        _offset: usize,
        _size: usize,
    ) -> Result<Option<CacheHit>, CacheError> {
        Ok(None)
    }

    async fn write(
        &self,
        _id: AssetId,
        _data: Bytes,
        _file_size: usize,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn remove(&self, _id: AssetId) {}

    fn prioritize_write(&self, _id: AssetId) {}
}
