//! In-process backend, mostly useful as a fake in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::{AppendObject, BlobStore, StoreError};

#[derive(Debug, thiserror::Error)]
#[error("injected failure on append call #{0}")]
struct InjectedFailure(u64);

#[derive(Default)]
struct State {
    containers: HashSet<String>,
    objects: HashMap<(String, String), Vec<u8>>,
    operations: u64,
    append_calls: u64,
    failures: VecDeque<(u64, bool)>,
}

/// Keeps containers and objects in memory. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the `call`-th append (1-based, counted across all objects) fail.
    pub fn fail_append(&self, call: u64, transient: bool) {
        self.lock().failures.push_back((call, transient));
    }

    /// Total number of calls made against this store and its objects.
    pub fn operations(&self) -> u64 {
        self.lock().operations
    }

    pub fn append_calls(&self) -> u64 {
        self.lock().append_calls
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn object(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(container.to_owned(), name.to_owned()))
            .cloned()
    }
}

impl BlobStore for MemoryStore {
    type Object = MemoryObject;

    async fn ensure_container(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.operations += 1;
        state.containers.insert(name.to_owned());
        Ok(())
    }

    async fn ensure_append_object(
        &self,
        container: &str,
        name: &str,
    ) -> Result<MemoryObject, StoreError> {
        let mut state = self.lock();
        state.operations += 1;
        if !state.containers.contains(container) {
            return Err(StoreError::ContainerNotFound(container.to_owned()));
        }

        let key = (container.to_owned(), name.to_owned());
        state.objects.entry(key.clone()).or_default();

        Ok(MemoryObject {
            store: self.clone(),
            key,
        })
    }
}

pub struct MemoryObject {
    store: MemoryStore,
    key: (String, String),
}

impl AppendObject for MemoryObject {
    async fn append_block(&mut self, block: Bytes) -> Result<(), StoreError> {
        let mut state = self.store.lock();
        state.operations += 1;
        state.append_calls += 1;

        let call = state.append_calls;
        if let Some(pos) = state.failures.iter().position(|(n, _)| *n == call) {
            let (_, transient) = state.failures.remove(pos).unwrap_or((call, false));
            return Err(StoreError::Request {
                operation: "append block",
                target: format!("{}/{}", self.key.0, self.key.1),
                transient,
                source: Box::new(InjectedFailure(call)),
            });
        }

        state
            .objects
            .entry(self.key.clone())
            .or_default()
            .extend_from_slice(&block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = MemoryStore::new();

        store.ensure_container("c").await.unwrap();
        store.ensure_container("c").await.unwrap();
        let mut first = store.ensure_append_object("c", "blob").await.unwrap();
        first.append_block(Bytes::from_static(b"abc")).await.unwrap();
        store.ensure_append_object("c", "blob").await.unwrap();

        assert_eq!(store.container_count(), 1);
        assert_eq!(store.object_count(), 1);
        assert_eq!(store.object("c", "blob").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_object_requires_container() {
        let store = MemoryStore::new();
        let err = store.ensure_append_object("missing", "blob").await;
        assert!(matches!(err, Err(StoreError::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.ensure_container("c").await.unwrap();
        let mut object = store.ensure_append_object("c", "blob").await.unwrap();
        store.fail_append(2, true);

        object.append_block(Bytes::from_static(b"a")).await.unwrap();
        let err = object
            .append_block(Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        object.append_block(Bytes::from_static(b"c")).await.unwrap();

        assert_eq!(store.object("c", "blob").unwrap(), b"ac");
        assert_eq!(store.append_calls(), 3);
    }
}
