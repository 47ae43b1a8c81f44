//! Codecs turn domain values into the opaque bytes carried by records and back. A
//! [CodecRegistry] resolves codecs by name and value type, so the same name ("json") can serve
//! several types.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::value::ValueMap;

mod envelope;
mod json;
mod proto;

pub use envelope::EnvelopeCodec;
pub use json::JsonCodec;
pub use proto::{ProtoCodec, RecordCodec};

pub const JSON: &str = "json";
pub const PROTO: &str = "proto";
pub const ENVELOPE: &str = "envelope";

/// Encodes and decodes values of type `T`. Decoding malformed bytes fails with
/// [Error::Codec], which is never retried.
pub trait Codec<T>: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, value: &T) -> Result<Bytes>;

    fn decode(&self, data: &[u8]) -> Result<T>;
}

/// Codecs keyed by `(name, type)`.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<(String, TypeId), Arc<dyn Any + Send + Sync>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing how to encode records ("proto", "json") and result maps ("json",
    /// "envelope").
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Record>(Arc::new(RecordCodec))
            .register::<Record>(Arc::new(JsonCodec::<Record>::new()))
            .register_serde::<ValueMap>();
        registry
    }

    pub fn register<T: 'static>(&mut self, codec: Arc<dyn Codec<T>>) -> &mut Self {
        let key = (codec.name().to_string(), TypeId::of::<T>());
        self.codecs.insert(key, Arc::new(codec));
        self
    }

    /// Registers the "json" and "envelope" codecs of a serde type.
    pub fn register_serde<T>(&mut self) -> &mut Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.register::<T>(Arc::new(JsonCodec::<T>::new()))
            .register::<T>(Arc::new(EnvelopeCodec::<T>::new()))
    }

    pub fn get<T: 'static>(&self, name: &str) -> Result<Arc<dyn Codec<T>>> {
        self.codecs
            .get(&(name.to_string(), TypeId::of::<T>()))
            .and_then(|codec| codec.downcast_ref::<Arc<dyn Codec<T>>>())
            .map(Arc::clone)
            .ok_or_else(|| {
                Error::Config(format!("no codec named {name} for {}", type_name::<T>()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::watermark::Watermark;

    #[test]
    fn resolves_by_name_and_type() {
        let registry = CodecRegistry::with_defaults();
        let record = Record::new("key", "data").with_watermark(Watermark::of_timestamp(9));
        for name in [PROTO, JSON] {
            let codec = registry.get::<Record>(name).unwrap();
            assert_eq!(codec.name(), name);
            let bytes = codec.encode(&record).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), record);
        }
        assert!(registry.get::<Record>(ENVELOPE).is_err());
        assert!(registry.get::<ValueMap>(PROTO).is_err());
    }

    #[test]
    fn registers_serde_types() {
        let mut registry = CodecRegistry::new();
        registry.register_serde::<Vec<String>>();
        let codec = registry.get::<Vec<String>>(ENVELOPE).unwrap();
        let value = vec!["a".to_string(), "b".to_string()];
        assert_eq!(codec.decode(&codec.encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn result_maps_keep_their_shape() {
        let registry = CodecRegistry::with_defaults();
        let codec = registry.get::<ValueMap>(ENVELOPE).unwrap();

        let empty = ValueMap::new();
        let decoded = codec.decode(&codec.encode(&empty).unwrap()).unwrap();
        assert!(decoded.is_empty());

        let mut nested = ValueMap::new();
        nested.insert("deep".into(), Value::BigInt(i128::from(i64::MAX) * 4));
        let mut map = ValueMap::new();
        map.insert("count".into(), Value::Int(3));
        map.insert("total".into(), Value::Long(3));
        map.insert("ratio".into(), Value::Float(0.5));
        map.insert("tags".into(), Value::List(vec!["x".into(), Value::Null]));
        map.insert("nested".into(), Value::Map(nested));
        map.insert("overflowed".into(), Value::Double(f64::INFINITY));
        map.insert("floor".into(), Value::Float(f32::NEG_INFINITY));
        let decoded = codec.decode(&codec.encode(&map).unwrap()).unwrap();
        assert_eq!(decoded, map);

        let mut undefined = ValueMap::new();
        undefined.insert("rate".into(), Value::Double(f64::NAN));
        let decoded = codec.decode(&codec.encode(&undefined).unwrap()).unwrap();
        assert!(decoded["rate"].as_f64().is_some_and(f64::is_nan));
    }

    #[test]
    fn malformed_bytes_are_not_retryable() {
        let registry = CodecRegistry::with_defaults();
        let codec = registry.get::<Record>(PROTO).unwrap();
        let err = codec.decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(!err.is_retryable());
    }
}
