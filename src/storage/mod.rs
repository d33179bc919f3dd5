//! Artifact store client interface.
//!
//! The [`ArtifactStore`] trait is the tracker's only view of durable object
//! storage: job inputs, outputs, manifests and completion markers all live
//! behind it.
//!
//! | Method | Used for |
//! |--------|----------|
//! | `sync()` | staging input under `{job_id}/in/` |
//! | `exists_nonempty()` | output check before success |
//! | `put_marker()` | completion signal at `{job_id}/done` |
//! | `put()` / `get()` / `list()` / `delete_prefix()` | manifests, CLI listing, download, delete |
//!
//! # Contract
//!
//! - Keys are `/`-separated, relative, with no `.` or `..` segments.
//! - Prefixes match on raw key strings: `"abc/out/"` matches
//!   `"abc/out/a.txt"` but not `"abc/outline"`.
//! - Clients never retry internally. Transient failures come back as-is so
//!   the tracker's backoff policy is the only retry loop.

pub mod error;
pub mod fs;
pub mod keys;
pub mod memory;

use async_trait::async_trait;

pub(crate) use error::validate_key;
pub use error::{StorageError, StorageResult};
pub use fs::LocalFsStore;
pub use memory::{InMemoryStore, StoreOp};

/// Durable object storage addressed by string keys.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write `data` at `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Read the object at `key`.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Recursively copy every object under `src_prefix` to the same relative
    /// key under `dst_prefix`, overwriting. A `src_prefix` without a trailing
    /// `/` names one object or directory: `in/a.mp3` copies `in/a.mp3` and
    /// anything under `in/a.mp3/`, never a sibling such as `in/a.mp3.bak`.
    ///
    /// Returns the number of objects copied; fails with
    /// [`StorageError::NotFound`] when nothing matches `src_prefix`.
    async fn sync(&self, src_prefix: &str, dst_prefix: &str) -> StorageResult<usize>;

    /// Whether at least one non-empty object exists under `prefix`.
    async fn exists_nonempty(&self, prefix: &str) -> StorageResult<bool>;

    /// Write a zero-length marker object at `key`.
    async fn put_marker(&self, key: &str) -> StorageResult<()> {
        self.put(key, Vec::new()).await
    }

    /// Remove every object under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;
}

/// Whether `key` is copied when syncing `src_prefix`.
pub(crate) fn sync_source_matches(key: &str, src_prefix: &str) -> bool {
    if src_prefix.is_empty() || src_prefix.ends_with('/') {
        return key.starts_with(src_prefix);
    }
    match key.strip_prefix(src_prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Destination key for `src_key` when syncing `src_prefix` to `dst_prefix`.
pub(crate) fn sync_destination(src_key: &str, src_prefix: &str, dst_prefix: &str) -> String {
    let suffix = &src_key[src_prefix.len()..];
    format!("{dst_prefix}{suffix}")
}
