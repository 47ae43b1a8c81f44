//! Bulk commands going through scheduler, an action and status aggregation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use logflow_bulk::{
    ACTION_STREAM, BulkCodecs, BulkCommand, BulkService, BulkState, BulkStatus, ParamKind,
    ParamSchema, STATUS_STREAM, SchemaCatalog, SchemaValidator, ValidatorRegistry,
    with_bulk_computations,
};
use logflow_core::codec::JSON;
use logflow_core::{
    Computation, ComputationContext, ComputationMetadata, LogRecord, MemoryLog, Result, Settings,
    StreamProcessor, Topology, Value,
};
use logflow_shared::kv::memory::MemoryKVStore;

/// Reports one processed document per delta, `documents` of them in total.
struct CountingAction {
    codecs: BulkCodecs,
}

#[async_trait]
impl Computation for CountingAction {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::with_arity("count-documents", 1, 1)
    }

    async fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        _input_stream: &str,
        record: &LogRecord,
    ) -> Result<()> {
        let command = self.codecs.decode_command(&record.record)?;
        let documents = match command.param("documents") {
            Some(Value::Int(n)) => u64::try_from(*n).unwrap_or(0),
            _ => 0,
        };
        let total = BulkStatus::delta(&command.id).total(documents);
        ctx.produce_record("o1", self.codecs.status_record(&total)?)?;
        for _ in 0..documents {
            let done = BulkStatus::delta(&command.id)
                .processed(1)
                .result("documents", 1)
                .result("bytes", 1024);
            ctx.produce_record("o1", self.codecs.status_record(&done)?)?;
        }
        ctx.ask_for_checkpoint();
        Ok(())
    }
}

fn settings() -> Settings {
    Settings::default()
        .with_max_wait(Duration::from_millis(10))
        .with_checkpoint_thresholds(1, Duration::from_millis(10))
}

fn validators() -> ValidatorRegistry {
    ValidatorRegistry::new().register(
        "countDocuments",
        Arc::new(SchemaValidator::new(
            ParamSchema::new().required("documents", ParamKind::Int),
            Arc::new(SchemaCatalog::new()),
        )),
    )
}

#[tokio::test]
async fn commands_run_to_completion() {
    let log = MemoryLog::new();
    let store = MemoryKVStore::new("bulk");
    let codecs = BulkCodecs::new(&BulkCodecs::registry(), JSON).unwrap();

    let action_codecs = codecs.clone();
    let actions = format!("i1:{ACTION_STREAM}");
    let statuses = format!("o1:{STATUS_STREAM}");
    let topology = with_bulk_computations(
        Topology::builder(),
        Arc::new(store.clone()),
        codecs.clone(),
        2,
    )
    .add_computation(
        move || CountingAction {
            codecs: action_codecs.clone(),
        },
        &[&actions, &statuses],
    )
    .build()
    .unwrap();

    let mut processor = StreamProcessor::new(Arc::new(log.clone()), topology, settings());
    processor.start().await.unwrap();
    assert!(
        processor
            .wait_for_assignments(Duration::from_secs(5))
            .await
            .unwrap()
    );

    let service = BulkService::new(
        Arc::new(log.clone()),
        Arc::new(store.clone()),
        validators(),
        codecs,
    );
    let mut ids = Vec::new();
    for documents in [3, 5, 8] {
        let command = BulkCommand::builder("countDocuments", "SELECT * FROM Document", "alice")
            .param("documents", documents)
            .build();
        ids.push((service.submit(command).await.unwrap(), documents));
    }
    let rejected = BulkCommand::builder("countDocuments", "q", "alice")
        .param("documents", "many")
        .build();
    assert!(service.submit(rejected).await.is_err());

    assert!(
        processor
            .drain_and_stop(Duration::from_secs(10))
            .await
            .unwrap()
    );

    for (id, documents) in ids {
        let status = service.status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, BulkState::Completed, "{status}");
        assert_eq!(status.processed, documents as u64);
        assert_eq!(status.total, documents as u64);
        assert_eq!(status.errors, 0);
        assert_eq!(status.result.get("documents"), Some(&Value::Int(documents)));
        assert_eq!(
            status.result.get("bytes"),
            Some(&Value::Int(1024 * documents))
        );
        let (started, completed) = (status.started_at.unwrap(), status.completed_at.unwrap());
        assert!(status.submitted_at.unwrap() <= started);
        assert!(started <= completed && completed <= Utc::now());
    }
}

#[tokio::test]
async fn unknown_command_has_no_status() {
    let service = BulkService::new(
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryKVStore::new("bulk")),
        validators(),
        BulkCodecs::new(&BulkCodecs::registry(), JSON).unwrap(),
    );
    assert!(service.status("nope").await.unwrap().is_none());
}
