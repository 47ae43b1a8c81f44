//! Generic Key-Value store traits for pluggable storage backends.
//!
//! Besides plain reads and writes a store offers a conditional update, which is what counters
//! shared by many processes are built on: read the current value, compute the next one and
//! write it only if nobody changed the key in between.
//!
//! The traits use `async_trait` so that stores can be used as `Arc<dyn KVStore>`.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Error;

pub mod memory;

/// Error type for KV operations (boxed for object safety)
pub type KVError = Box<dyn StdError + Send + Sync + 'static>;

/// Counters are stored as decimal text.
pub fn encode_counter(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

pub fn decode_counter(key: &str, value: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| Error::Counter(format!("value of {key} is not a number")))
}

#[async_trait]
pub trait KVStore: Send + Sync {
    /// Get all keys from the KV store.
    async fn keys(&self) -> Result<Vec<String>, KVError>;

    async fn delete(&self, key: &str) -> Result<(), KVError>;

    /// Insert or update a key-value pair.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), KVError>;

    /// `Ok(None)` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KVError>;

    /// Sets `key` to `value` only if its current value is `expected` (`None` meaning absent).
    /// Returns false, leaving the store untouched, when the current value differs.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Bytes>,
        value: Bytes,
    ) -> Result<bool, KVError>;

    /// Get the store name/identifier.
    fn name(&self) -> &str;

    /// Atomically adds `delta` to the counter stored at `key` (absent counts as 0) and returns
    /// the new value.
    async fn add_and_get(&self, key: &str, delta: i64) -> Result<i64, KVError> {
        loop {
            let current = self.get(key).await?;
            let value = match &current {
                Some(bytes) => decode_counter(key, bytes)?,
                None => 0,
            };
            let next = value.checked_add(delta).ok_or_else(|| {
                Error::Overflow(format!("{key}: {value} + {delta} does not fit in 64 bits"))
            })?;
            if self
                .compare_and_set(key, current, encode_counter(next))
                .await?
            {
                return Ok(next);
            }
            // lost the race, read again
            tokio::task::yield_now().await;
        }
    }
}
