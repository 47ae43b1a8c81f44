use std::sync::Arc;

use async_trait::async_trait;
use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use logflow_shared::error::Error as SharedError;
use logflow_shared::kv::{KVError, KVStore, decode_counter, encode_counter};
use tracing::{info, warn};

use crate::error::{Error, Result};

const STORE_RETRIES: usize = 3;
const STORE_RETRY_DELAY_MILLIS: u64 = 10;

#[async_trait]
pub trait Sequencer: Send + Sync {
    /// Next value of the sequence, failing once the sequence no longer fits in 32 bits.
    async fn get_next(&self, key: &str) -> Result<i32>;

    async fn get_next_long(&self, key: &str) -> Result<i64>;

    /// Reserves `size` consecutive values, returned in increasing order.
    async fn get_next_block(&self, key: &str, size: usize) -> Result<Vec<i64>>;

    /// Skips the sequence ahead so that the next value is `value + 1`. Fails if `value` is not
    /// greater than the current value.
    async fn init_sequence(&self, key: &str, value: i64) -> Result<()>;
}

/// [Sequencer] keeping every sequence as a counter in a key/value store.
pub struct KVSequencer {
    store: Arc<dyn KVStore>,
}

impl KVSequencer {
    pub fn new(store: Arc<dyn KVStore>) -> Self {
        Self { store }
    }

    /// Adds `delta` to the counter, retrying store failures. Malformed or overflowing counters
    /// are not retried.
    async fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let strategy = Exponential::from_millis(STORE_RETRY_DELAY_MILLIS).max_retries(STORE_RETRIES);
        let operation = || {
            let store = Arc::clone(&self.store);
            let key = key.to_string();
            async move { store.add_and_get(&key, delta).await }
        };
        let condition = |error: &KVError, attempt: usize| {
            let retryable = error.downcast_ref::<SharedError>().is_none();
            if retryable {
                warn!(%error, attempt, key, "Sequence update failed, retrying");
            }
            retryable
        };
        Retry::new(strategy, operation, condition)
            .await
            .map_err(|e| store_error(key, delta, e))
    }
}

fn store_error(key: &str, delta: i64, error: KVError) -> Error {
    match error.downcast_ref::<SharedError>() {
        Some(SharedError::Overflow(_)) => Error::Overflow {
            key: key.to_string(),
            value: delta,
            range: "i64",
        },
        _ => Error::Store(error.to_string()),
    }
}

#[async_trait]
impl Sequencer for KVSequencer {
    async fn get_next(&self, key: &str) -> Result<i32> {
        let value = self.add(key, 1).await?;
        i32::try_from(value).map_err(|_| Error::Overflow {
            key: key.to_string(),
            value,
            range: "i32",
        })
    }

    async fn get_next_long(&self, key: &str) -> Result<i64> {
        self.add(key, 1).await
    }

    async fn get_next_block(&self, key: &str, size: usize) -> Result<Vec<i64>> {
        let delta = i64::try_from(size)
            .ok()
            .filter(|delta| *delta > 0)
            .ok_or_else(|| Error::BlockSize {
                key: key.to_string(),
                size,
            })?;
        let last = self.add(key, delta).await?;
        Ok((last - delta + 1..=last).collect())
    }

    async fn init_sequence(&self, key: &str, value: i64) -> Result<()> {
        loop {
            let stored = self
                .store
                .get(key)
                .await
                .map_err(|e| Error::Store(e.to_string()))?;
            let current = match &stored {
                Some(bytes) => {
                    decode_counter(key, bytes).map_err(|e| Error::Store(e.to_string()))?
                }
                None => 0,
            };
            if value <= current {
                return Err(Error::Init {
                    key: key.to_string(),
                    value,
                    current,
                });
            }
            let updated = self
                .store
                .compare_and_set(key, stored, encode_counter(value))
                .await
                .map_err(|e| Error::Store(e.to_string()))?;
            if updated {
                info!(key, value, "Sequence initialized");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use logflow_shared::kv::memory::MemoryKVStore;

    use super::*;

    fn sequencer() -> (MemoryKVStore, KVSequencer) {
        let store = MemoryKVStore::new("sequences");
        let sequencer = KVSequencer::new(Arc::new(store.clone()));
        (store, sequencer)
    }

    #[tokio::test]
    async fn sequences_are_independent() {
        let (_, sequencer) = sequencer();
        assert_eq!(sequencer.get_next("a").await.unwrap(), 1);
        assert_eq!(sequencer.get_next("a").await.unwrap(), 2);
        assert_eq!(sequencer.get_next_long("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn block_is_contiguous_and_followed() {
        let (_, sequencer) = sequencer();
        sequencer.get_next("k").await.unwrap();
        let block = sequencer.get_next_block("k", 100).await.unwrap();
        assert_eq!(block.len(), 100);
        assert!(block.windows(2).all(|pair| pair[1] == pair[0] + 1));
        assert_eq!(block.first(), Some(&2));
        let next = sequencer.get_next_long("k").await.unwrap();
        assert!(next > *block.last().unwrap());
        assert!(matches!(
            sequencer.get_next_block("k", 0).await,
            Err(Error::BlockSize { size: 0, .. })
        ));
    }

    #[tokio::test]
    async fn init_skips_ahead() {
        let (_, sequencer) = sequencer();
        sequencer.init_sequence("k", 1000).await.unwrap();
        assert_eq!(sequencer.get_next("k").await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn init_never_goes_back() {
        let (store, sequencer) = sequencer();
        sequencer.init_sequence("k", 50).await.unwrap();
        let err = sequencer.init_sequence("k", 50).await.unwrap_err();
        assert_eq!(
            err,
            Error::Init {
                key: "k".to_string(),
                value: 50,
                current: 50
            }
        );
        let message = sequencer.init_sequence("k", 10).await.unwrap_err().to_string();
        assert!(message.contains("k") && message.contains("10"));
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from("50")));
    }

    #[tokio::test]
    async fn int_overflow_is_reported() {
        let (_, sequencer) = sequencer();
        sequencer
            .init_sequence("k", i64::from(i32::MAX) - 1)
            .await
            .unwrap();
        assert_eq!(sequencer.get_next("k").await.unwrap(), i32::MAX);
        assert!(matches!(
            sequencer.get_next("k").await,
            Err(Error::Overflow { range: "i32", .. })
        ));
        // the long view of the same sequence keeps going
        assert!(sequencer.get_next_long("k").await.unwrap() > i64::from(i32::MAX));
    }

    #[tokio::test]
    async fn long_overflow_is_not_retried() {
        let (_, sequencer) = sequencer();
        sequencer.init_sequence("k", i64::MAX).await.unwrap();
        assert!(matches!(
            sequencer.get_next_long("k").await,
            Err(Error::Overflow { range: "i64", .. })
        ));
    }

    #[tokio::test]
    async fn store_failures_are_retried() {
        let (store, sequencer) = sequencer();
        store.error_injector().fail_compare_and_sets(2);
        assert_eq!(sequencer.get_next("k").await.unwrap(), 1);

        store.error_injector().fail_gets(10);
        assert!(matches!(
            sequencer.get_next("k").await,
            Err(Error::Store(_))
        ));
    }
}
