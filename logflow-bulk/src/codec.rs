use std::sync::Arc;

use logflow_core::codec::{Codec, CodecRegistry};
use logflow_core::Record;

use crate::command::BulkCommand;
use crate::error::Result;
use crate::status::BulkStatus;

/// Codecs of the payloads carried by the bulk streams, resolved once by name.
#[derive(Clone)]
pub struct BulkCodecs {
    command: Arc<dyn Codec<BulkCommand>>,
    status: Arc<dyn Codec<BulkStatus>>,
}

impl BulkCodecs {
    /// Registry with the default codecs plus the bulk payloads.
    pub fn registry() -> CodecRegistry {
        let mut registry = CodecRegistry::with_defaults();
        registry
            .register_serde::<BulkCommand>()
            .register_serde::<BulkStatus>();
        registry
    }

    pub fn new(registry: &CodecRegistry, name: &str) -> Result<Self> {
        Ok(Self {
            command: registry.get::<BulkCommand>(name)?,
            status: registry.get::<BulkStatus>(name)?,
        })
    }

    /// Command record, keyed by the command id so every record of a command shares a partition.
    pub fn command_record(&self, command: &BulkCommand) -> Result<Record> {
        Ok(Record::new(command.id.clone(), self.command.encode(command)?))
    }

    pub fn decode_command(&self, record: &Record) -> Result<BulkCommand> {
        Ok(self.command.decode(record.data())?)
    }

    pub fn status_record(&self, status: &BulkStatus) -> Result<Record> {
        Ok(Record::new(status.command_id.clone(), self.status.encode(status)?))
    }

    pub fn decode_status(&self, record: &Record) -> Result<BulkStatus> {
        Ok(self.status.decode(record.data())?)
    }
}

#[cfg(test)]
mod tests {
    use logflow_core::codec::{ENVELOPE, JSON};
    use logflow_core::Error as CoreError;

    use super::*;
    use crate::error::Error;

    #[test]
    fn records_are_keyed_by_command() {
        let codecs = BulkCodecs::new(&BulkCodecs::registry(), JSON).unwrap();
        let command = BulkCommand::builder("export", "q", "u").param("n", 3).build();
        let record = codecs.command_record(&command).unwrap();
        assert_eq!(record.key(), command.id);
        assert_eq!(codecs.decode_command(&record).unwrap(), command);

        let status = BulkStatus::delta(&command.id).processed(2);
        let record = codecs.status_record(&status).unwrap();
        assert_eq!(record.key(), command.id);
        assert_eq!(codecs.decode_status(&record).unwrap(), status);
    }

    #[test]
    fn envelope_codec_is_available() {
        assert!(BulkCodecs::new(&BulkCodecs::registry(), ENVELOPE).is_ok());
        assert!(BulkCodecs::new(&BulkCodecs::registry(), "avro").is_err());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let codecs = BulkCodecs::new(&BulkCodecs::registry(), JSON).unwrap();
        let err = codecs
            .decode_command(&Record::new("k", "not json"))
            .unwrap_err();
        assert!(matches!(err, Error::Core(CoreError::Codec(_))));
        assert!(!CoreError::from(err).is_retryable());
    }
}
