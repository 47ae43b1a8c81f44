use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use prost::Message;

use crate::codec::{Codec, PROTO};
use crate::error::Result;
use crate::record::Record;
use crate::watermark::Watermark;

/// Codec for any prost message.
pub struct ProtoCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> ProtoCodec<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for ProtoCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Codec<M> for ProtoCodec<M>
where
    M: Message + Default,
{
    fn name(&self) -> &str {
        PROTO
    }

    fn encode(&self, value: &M) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(value.encoded_len());
        value.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Result<M> {
        Ok(M::decode(data)?)
    }
}

/// Wire form of a [Record].
#[derive(Clone, PartialEq, Message)]
struct RecordProto {
    #[prost(string, tag = "1")]
    key: String,
    #[prost(bytes = "bytes", tag = "2")]
    data: Bytes,
    #[prost(int64, tag = "3")]
    watermark: i64,
    #[prost(string, repeated, tag = "4")]
    flags: Vec<String>,
}

/// Protobuf codec for records, the default physical encoding of the in-memory log.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordCodec;

impl Codec<Record> for RecordCodec {
    fn name(&self) -> &str {
        PROTO
    }

    fn encode(&self, value: &Record) -> Result<Bytes> {
        let (key, data, watermark, flags) = value.clone().into_parts();
        let proto = RecordProto {
            key,
            data,
            watermark: watermark.value(),
            flags: flags.into_iter().collect(),
        };
        ProtoCodec::<RecordProto>::new().encode(&proto)
    }

    fn decode(&self, data: &[u8]) -> Result<Record> {
        let proto = ProtoCodec::<RecordProto>::new().decode(data)?;
        Ok(proto.flags.into_iter().fold(
            Record::new(proto.key, proto.data).with_watermark(Watermark::from_value(proto.watermark)),
            Record::with_flag,
        ))
    }
}
