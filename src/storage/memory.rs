//! In-memory artifact store with fault injection, for tests and the demo.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::error::{validate_key, StorageError, StorageResult};
use super::{sync_destination, sync_source_matches, ArtifactStore};

/// Store operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Put,
    Get,
    List,
    Sync,
    ExistsNonempty,
    PutMarker,
    DeletePrefix,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Vec<u8>>,
    calls: HashMap<StoreOp, u32>,
    failures: HashMap<StoreOp, u32>,
    latency: Option<Duration>,
}

/// A [`BTreeMap`]-backed [`ArtifactStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object without going through the async API.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.lock().objects.insert(key.into(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: StoreOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Make the next `times` calls to `op` fail with [`StorageError::Unavailable`].
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.lock().failures.insert(op, times);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    async fn enter(&self, op: StoreOp) -> StorageResult<()> {
        let latency = {
            let mut inner = self.lock();
            *inner.calls.entry(op).or_insert(0) += 1;
            inner.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.lock();
        if let Some(remaining) = inner.failures.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StorageError::Unavailable(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.enter(StoreOp::Put).await?;
        validate_key(key)?;
        self.lock().objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.enter(StoreOp::Get).await?;
        validate_key(key)?;
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.enter(StoreOp::List).await?;
        Ok(self
            .lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn sync(&self, src_prefix: &str, dst_prefix: &str) -> StorageResult<usize> {
        self.enter(StoreOp::Sync).await?;
        validate_key(src_prefix)?;
        validate_key(dst_prefix)?;
        let mut inner = self.lock();
        let copies: Vec<(String, Vec<u8>)> = inner
            .objects
            .range(src_prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(src_prefix))
            .filter(|(k, _)| sync_source_matches(k, src_prefix))
            .map(|(k, v)| (sync_destination(k, src_prefix, dst_prefix), v.clone()))
            .collect();
        if copies.is_empty() {
            return Err(StorageError::NotFound(src_prefix.to_string()));
        }
        let count = copies.len();
        inner.objects.extend(copies);
        Ok(count)
    }

    async fn exists_nonempty(&self, prefix: &str) -> StorageResult<bool> {
        self.enter(StoreOp::ExistsNonempty).await?;
        Ok(self
            .lock()
            .objects
            .iter()
            .any(|(k, v)| k.starts_with(prefix) && !v.is_empty()))
    }

    async fn put_marker(&self, key: &str) -> StorageResult<()> {
        self.enter(StoreOp::PutMarker).await?;
        validate_key(key)?;
        self.lock().objects.insert(key.to_string(), Vec::new());
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        self.enter(StoreOp::DeletePrefix).await?;
        validate_key(prefix)?;
        let mut inner = self.lock();
        let before = inner.objects.len();
        inner.objects.retain(|k, _| !k.starts_with(prefix));
        Ok(before - inner.objects.len())
    }
}
