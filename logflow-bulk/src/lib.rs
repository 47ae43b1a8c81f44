//! Bulk commands: an action applied to every document matched by a query, run asynchronously
//! on the stream engine.
//!
//! A [BulkCommand] is validated by the [Validator] of its action, then admitted by the
//! [BulkService] to the command stream. Workers report progress as [BulkStatus] deltas which
//! are merged, in any order, into the status returned by [BulkService::status].

pub mod codec;
pub mod command;
pub mod computation;
pub mod error;
pub mod merge;
pub mod service;
pub mod status;
pub mod validation;

pub use crate::codec::BulkCodecs;
pub use crate::command::{BulkCommand, BulkCommandBuilder};
pub use crate::computation::{SchedulerComputation, StatusComputation, with_bulk_computations};
pub use crate::error::{Error, Result};
pub use crate::merge::merge_values;
pub use crate::service::{ACTION_STREAM, BulkService, COMMAND_STREAM, STATUS_STREAM};
pub use crate::status::{BulkState, BulkStatus};
pub use crate::validation::{
    ParamKind, ParamSchema, SchemaCatalog, SchemaValidator, Validator, ValidatorRegistry,
};
