//! Artifact store backed by a local directory tree.
//!
//! Key `a/b/c.txt` lives at `<root>/a/b/c.txt`. Used by the CLI and by the
//! process backend, which hands job directories to child processes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::error::{validate_key, StorageError, StorageResult};
use super::{sync_destination, sync_source_matches, ArtifactStore};

#[derive(Debug, Clone)]
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for `key`. Trailing `/` keys map to directories.
    pub fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key.trim_end_matches('/')))
    }

    /// Directory to walk when listing `prefix`.
    fn walk_root(&self, prefix: &str) -> PathBuf {
        match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        }
    }

    /// Every file under `dir` as `(key, size)`.
    async fn walk(&self, dir: PathBuf) -> StorageResult<Vec<(String, u64)>> {
        let mut files = Vec::new();
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    files.push((key, meta.len()));
                }
            }
        }
        Ok(files)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    async fn matching(&self, prefix: &str) -> StorageResult<Vec<(String, u64)>> {
        let mut files: Vec<_> = self
            .walk(self.walk_root(prefix))
            .await?
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ArtifactStore for LocalFsStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .matching(prefix)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    async fn sync(&self, src_prefix: &str, dst_prefix: &str) -> StorageResult<usize> {
        validate_key(src_prefix)?;
        validate_key(dst_prefix)?;
        let mut sources = self.matching(src_prefix).await?;
        sources.retain(|(k, _)| sync_source_matches(k, src_prefix));
        if sources.is_empty() {
            return Err(StorageError::NotFound(src_prefix.to_string()));
        }
        for (key, _) in &sources {
            let dst = self.path_for(&sync_destination(key, src_prefix, dst_prefix))?;
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(self.root.join(key), &dst).await?;
        }
        tracing::debug!(src_prefix, dst_prefix, count = sources.len(), "Synced objects");
        Ok(sources.len())
    }

    async fn exists_nonempty(&self, prefix: &str) -> StorageResult<bool> {
        Ok(self.matching(prefix).await?.iter().any(|(_, size)| *size > 0))
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        validate_key(prefix)?;
        let files = self.matching(prefix).await?;
        for (key, _) in &files {
            match fs::remove_file(self.root.join(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if prefix.ends_with('/') {
            // Leftover empty directories are harmless; ignore failures.
            let _ = fs::remove_dir_all(self.path_for(prefix)?).await;
        }
        Ok(files.len())
    }
}
