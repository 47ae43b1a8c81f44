/// Error exposed by the shared library.
pub mod error;

/// Key/value store contract with conditional updates, plus an in-memory store.
pub mod kv;
