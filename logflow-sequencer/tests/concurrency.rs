use std::collections::BTreeSet;
use std::sync::Arc;

use logflow_sequencer::{KVSequencer, Sequencer};
use logflow_shared::kv::memory::MemoryKVStore;
use tokio::task::JoinSet;

const CALLS: usize = 5_000;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_callers_get_distinct_values() {
    let sequencer = Arc::new(KVSequencer::new(Arc::new(MemoryKVStore::new("sequences"))));

    let mut calls = JoinSet::new();
    for _ in 0..CALLS {
        let sequencer = Arc::clone(&sequencer);
        calls.spawn(async move { sequencer.get_next("documents").await });
    }
    let mut values = BTreeSet::new();
    while let Some(value) = calls.join_next().await {
        values.insert(value.unwrap().unwrap());
    }

    assert_eq!(values.len(), CALLS);
    let next = sequencer.get_next("documents").await.unwrap();
    assert!(values.iter().all(|value| *value < next));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocks_and_single_values_never_overlap() {
    let sequencer = Arc::new(KVSequencer::new(Arc::new(MemoryKVStore::new("sequences"))));

    let mut calls = JoinSet::new();
    for i in 0..200 {
        let sequencer = Arc::clone(&sequencer);
        calls.spawn(async move {
            if i % 2 == 0 {
                sequencer.get_next_block("ids", 10).await.unwrap()
            } else {
                vec![sequencer.get_next_long("ids").await.unwrap()]
            }
        });
    }
    let mut values = Vec::new();
    while let Some(reserved) = calls.join_next().await {
        values.extend(reserved.unwrap());
    }

    let total = values.len();
    let distinct: BTreeSet<i64> = values.into_iter().collect();
    assert_eq!(total, 100 * 10 + 100);
    assert_eq!(distinct.len(), total);
    assert_eq!(distinct.last(), Some(&(total as i64)));
}
