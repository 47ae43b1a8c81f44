use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use logflow_core::log::determine_partition;
use logflow_core::Log;
use logflow_shared::kv::KVStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::BulkCodecs;
use crate::command::BulkCommand;
use crate::error::{Error, Result};
use crate::status::BulkStatus;
use crate::validation::ValidatorRegistry;

/// Admitted commands, keyed by command id.
pub const COMMAND_STREAM: &str = "bulk-command";
/// Commands handed over to the action computations.
pub const ACTION_STREAM: &str = "bulk-action";
/// Status deltas reported while commands run.
pub const STATUS_STREAM: &str = "bulk-status";

pub(crate) fn status_key(command_id: &str) -> String {
    format!("status:{command_id}")
}

/// Aggregated status as stored, with the last delta offset applied per status partition so a
/// replayed delta is recognized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StatusEntry {
    pub(crate) status: BulkStatus,
    #[serde(default)]
    pub(crate) applied: BTreeMap<u16, i64>,
}

impl StatusEntry {
    pub(crate) fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Entry point of bulk commands: admission and status lookups.
pub struct BulkService {
    log: Arc<dyn Log>,
    store: Arc<dyn KVStore>,
    validators: ValidatorRegistry,
    codecs: BulkCodecs,
}

impl BulkService {
    pub fn new(
        log: Arc<dyn Log>,
        store: Arc<dyn KVStore>,
        validators: ValidatorRegistry,
        codecs: BulkCodecs,
    ) -> Self {
        Self {
            log,
            store,
            validators,
            codecs,
        }
    }

    /// Validates the command, stores it as scheduled and appends it to the command stream.
    /// Returns the command id.
    pub async fn submit(&self, command: BulkCommand) -> Result<String> {
        self.validators.validate(&command)?;
        let id = command.id.clone();
        let record = self.codecs.command_record(&command)?;

        let scheduled = StatusEntry {
            status: BulkStatus::scheduled(&id, command.submitted_at),
            applied: BTreeMap::new(),
        };
        self.store
            .put(&status_key(&id), scheduled.encode()?)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;

        let appended = async {
            let partitions = self.log.partitions(COMMAND_STREAM).await?;
            self.log
                .append(COMMAND_STREAM, determine_partition(&id, partitions), record)
                .await
        }
        .await;
        match appended {
            Ok(offset) => {
                info!(command = %id, action = %command.action, offset, "Bulk command submitted");
                Ok(id)
            }
            Err(e) => {
                warn!(command = %id, error = %e, "Bulk command could not be scheduled");
                let aborted = StatusEntry {
                    status: scheduled.status.aborted(Utc::now()),
                    applied: BTreeMap::new(),
                };
                self.store
                    .put(&status_key(&id), aborted.encode()?)
                    .await
                    .map_err(|e| Error::Store(e.to_string()))?;
                Err(Error::Core(e.into()))
            }
        }
    }

    /// Aggregated status of a command, `None` for a command never submitted.
    pub async fn status(&self, command_id: &str) -> Result<Option<BulkStatus>> {
        let stored = self
            .store
            .get(&status_key(command_id))
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        stored
            .map(|data| StatusEntry::decode(&data).map(|entry| entry.status))
            .transpose()
    }
}
