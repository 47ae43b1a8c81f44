use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{Codec, ENVELOPE};
use crate::error::{Error, Result};

const CONTENT_TYPE: &str = "application/json";

/// Binary envelope around a self-describing text payload.
#[derive(Clone, PartialEq, Message)]
struct Envelope {
    #[prost(string, tag = "1")]
    content_type: String,
    #[prost(string, tag = "2")]
    payload: String,
}

/// Stores the JSON text of a value inside a protobuf [Envelope]. Used for heterogeneous maps
/// whose shape is only known at runtime.
pub struct EnvelopeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> EnvelopeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for EnvelopeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for EnvelopeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        ENVELOPE
    }

    fn encode(&self, value: &T) -> Result<Bytes> {
        let envelope = Envelope {
            content_type: CONTENT_TYPE.to_string(),
            payload: serde_json::to_string(value)?,
        };
        let mut buf = BytesMut::with_capacity(envelope.encoded_len());
        envelope.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Result<T> {
        let envelope = Envelope::decode(data)?;
        if envelope.content_type != CONTENT_TYPE {
            return Err(Error::Codec(format!(
                "unsupported envelope content type {:?}",
                envelope.content_type
            )));
        }
        Ok(serde_json::from_str(&envelope.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_content() {
        let codec = EnvelopeCodec::<Vec<u32>>::new();
        let mut buf = BytesMut::new();
        Envelope {
            content_type: "text/csv".into(),
            payload: "1,2".into(),
        }
        .encode(&mut buf)
        .unwrap();
        assert!(matches!(codec.decode(&buf), Err(Error::Codec(_))));
    }
}
