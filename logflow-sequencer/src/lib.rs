//! Distributed sequences. Every value handed out for a key is strictly greater than all values
//! handed out before for that key, no matter how many processes ask concurrently. The counter
//! lives in a [logflow_shared::kv::KVStore] and is only ever changed through its conditional
//! update.

pub mod error;
mod sequencer;

pub use crate::error::{Error, Result};
pub use crate::sequencer::{KVSequencer, Sequencer};
