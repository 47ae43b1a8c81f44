//! In-memory [KVStore]. Clones share the same data. The [KVErrorInjector] lets tests fail the
//! next operations or slow them down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;

use crate::kv::{KVError, KVStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryKVStoreError {
    #[error("Failed to get value: {0}")]
    Get(String),

    #[error("Failed to put value: {0}")]
    Put(String),

    #[error("Failed to compare and set value: {0}")]
    CompareAndSet(String),
}

#[derive(Debug, Default)]
pub struct KVErrorInjector {
    fail_next_gets: AtomicUsize,
    fail_next_puts: AtomicUsize,
    fail_next_cas: AtomicUsize,
    latency_ms: AtomicU64,
}

impl KVErrorInjector {
    pub fn fail_gets(&self, count: usize) {
        self.fail_next_gets.store(count, Ordering::Relaxed);
    }

    pub fn fail_puts(&self, count: usize) {
        self.fail_next_puts.store(count, Ordering::Relaxed);
    }

    pub fn fail_compare_and_sets(&self, count: usize) {
        self.fail_next_cas.store(count, Ordering::Relaxed);
    }

    /// Latency added to every operation.
    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    async fn apply_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryKVStore {
    name: String,
    data: Arc<RwLock<HashMap<String, Bytes>>>,
    error_injector: Arc<KVErrorInjector>,
}

impl MemoryKVStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(RwLock::new(HashMap::new())),
            error_injector: Arc::new(KVErrorInjector::default()),
        }
    }

    pub fn error_injector(&self) -> &KVErrorInjector {
        &self.error_injector
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl KVStore for MemoryKVStore {
    async fn keys(&self) -> Result<Vec<String>, KVError> {
        self.error_injector.apply_latency().await;
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), KVError> {
        self.error_injector.apply_latency().await;
        self.data.write().remove(key);
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), KVError> {
        self.error_injector.apply_latency().await;
        if KVErrorInjector::decrement_counter(&self.error_injector.fail_next_puts) {
            return Err(Box::new(MemoryKVStoreError::Put(
                "injected failure".to_string(),
            )));
        }
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, KVError> {
        self.error_injector.apply_latency().await;
        if KVErrorInjector::decrement_counter(&self.error_injector.fail_next_gets) {
            return Err(Box::new(MemoryKVStoreError::Get(
                "injected failure".to_string(),
            )));
        }
        Ok(self.data.read().get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Bytes>,
        value: Bytes,
    ) -> Result<bool, KVError> {
        self.error_injector.apply_latency().await;
        if KVErrorInjector::decrement_counter(&self.error_injector.fail_next_cas) {
            return Err(Box::new(MemoryKVStoreError::CompareAndSet(
                "injected failure".to_string(),
            )));
        }
        let mut data = self.data.write();
        if data.get(key) != expected.as_ref() {
            return Ok(false);
        }
        data.insert(key.to_string(), value);
        Ok(true)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
