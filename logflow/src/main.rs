use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use logflow_core::codec::CodecRegistry;
use logflow_core::config::config;
use logflow_core::metrics::encode_metrics;
use logflow_core::{MemoryLog, Record, StreamProcessor};
use logflow_sequencer::KVSequencer;
use logflow_shared::kv::memory::MemoryKVStore;
use tracing::{debug, error, info, warn};

mod demo;
mod setup_tracing;

const RECORDS: usize = 10_000;
const PARTITIONS: u16 = 4;
const ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = config()?.clone();
    let codec = CodecRegistry::with_defaults().get::<Record>(&settings.codec)?;
    let log = Arc::new(MemoryLog::with_codec(codec));
    let sequencer = Arc::new(KVSequencer::new(Arc::new(MemoryKVStore::new("sequences"))));
    let totals = demo::Totals::default();
    let topology = demo::topology(sequencer, totals.clone(), RECORDS, PARTITIONS)?;
    info!(%topology, codec = %settings.codec, "Starting topology");

    let mut processor = StreamProcessor::new(log, topology, settings);
    processor.start().await?;
    if !processor.wait_for_assignments(ASSIGNMENT_TIMEOUT).await? {
        warn!(timeout = ?ASSIGNMENT_TIMEOUT, "Not every task was assigned in time");
    }

    let drained = tokio::select! {
        drained = processor.drain_and_stop(DRAIN_TIMEOUT) => Some(drained?),
        _ = tokio::signal::ctrl_c() => None,
    };
    match drained {
        Some(true) => info!("Topology drained"),
        Some(false) => warn!(timeout = ?DRAIN_TIMEOUT, "Topology not drained in time"),
        None => {
            info!("Interrupted, stopping the topology");
            if !processor.stop(STOP_TIMEOUT).await? {
                warn!(timeout = ?STOP_TIMEOUT, "Tasks aborted");
            }
        }
    }

    let computations: Vec<(String, bool)> = processor
        .topology()
        .computations()
        .map(|metadata| (metadata.name().to_string(), metadata.is_source()))
        .collect();
    for (computation, source) in computations {
        let watermark = processor.low_watermark(&computation);
        if source {
            info!(%computation, %watermark, "Low watermark");
        } else {
            let lag = processor.lag(&computation).await?;
            info!(%computation, %watermark, %lag, "Low watermark and lag");
        }
    }
    let totals = totals.snapshot();
    let (count, sum) = totals
        .values()
        .fold((0u64, 0i128), |(count, sum), (c, s)| (count + c, sum + s));
    info!(keys = totals.len(), count, sum = %sum, "Counted records");
    debug!(metrics = %encode_metrics()?, "Metrics");

    Ok(())
}
