//! Length-prefixed framing for NNTSC messages, usable with
//! `tokio_util`'s `Framed` transports on both ends of the connection.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    msgtype, AggregateRequest, CancelNotice, CollectionList, HistoryBlock, LiveRecord, Message,
    PercentileRequest, PushCheckpoint, Request, SchemaDescription, StreamBatch, SubscribeRequest,
    VersionCheck, PROTOCOL_VERSION,
};

const HEADER_LEN: usize = 4;
const REQUEST_BODY_LEN: usize = 12;

/// Bodies are length-prefixed with a u16, which bounds them.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("unsupported header version {0}")]
    HeaderVersion(u8),

    #[error("message body of {0} bytes exceeds the frame limit")]
    Oversize(usize),

    #[error("request body must be exactly {REQUEST_BODY_LEN} bytes, got {0}")]
    BadRequestBody(usize),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NntscCodec;

impl NntscCodec {
    pub fn new() -> Self {
        NntscCodec
    }
}

impl Decoder for NntscCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = src[0];
        let mtype = src[1];
        let body_len = u16::from_be_bytes([src[2], src[3]]) as usize;

        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len);

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::HeaderVersion(version));
        }

        decode_body(mtype, &body).map(Some)
    }
}

impl Encoder<Message> for NntscCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = encode_body(&message)?;
        if body.len() > MAX_BODY_LEN {
            return Err(ProtocolError::Oversize(body.len()));
        }

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(message.msgtype());
        dst.put_u16(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

fn encode_body(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    Ok(match message {
        Message::Request(req) => {
            let mut body = Vec::with_capacity(REQUEST_BODY_LEN);
            body.extend_from_slice(&req.reqtype.to_be_bytes());
            body.extend_from_slice(&req.collection.to_be_bytes());
            body.extend_from_slice(&req.start.to_be_bytes());
            body
        }
        Message::History(block) => {
            let json = serde_json::to_vec(block)?;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?
        }
        Message::Collections(body) => serde_json::to_vec(body)?,
        Message::Schemas(body) => serde_json::to_vec(body)?,
        Message::Streams(body) => serde_json::to_vec(body)?,
        Message::Live(body) => serde_json::to_vec(body)?,
        Message::Subscribe(body) => serde_json::to_vec(body)?,
        Message::Aggregate(body) => serde_json::to_vec(body)?,
        Message::Percentile(body) => serde_json::to_vec(body)?,
        Message::QueryCancelled(body) => serde_json::to_vec(body)?,
        Message::Push(body) => serde_json::to_vec(body)?,
        Message::VersionCheck(body) => serde_json::to_vec(body)?,
    })
}

fn decode_body(mtype: u8, body: &[u8]) -> Result<Message, ProtocolError> {
    Ok(match mtype {
        msgtype::REQUEST => {
            if body.len() != REQUEST_BODY_LEN {
                return Err(ProtocolError::BadRequestBody(body.len()));
            }
            let word = |i: usize| {
                u32::from_be_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]])
            };
            Message::Request(Request {
                reqtype: word(0),
                collection: word(4),
                start: word(8),
            })
        }
        msgtype::HISTORY => {
            let mut json = Vec::new();
            ZlibDecoder::new(body).read_to_end(&mut json)?;
            Message::History(serde_json::from_slice::<HistoryBlock>(&json)?)
        }
        msgtype::COLLECTIONS => {
            Message::Collections(serde_json::from_slice::<CollectionList>(body)?)
        }
        msgtype::SCHEMAS => Message::Schemas(serde_json::from_slice::<SchemaDescription>(body)?),
        msgtype::STREAMS => Message::Streams(serde_json::from_slice::<StreamBatch>(body)?),
        msgtype::LIVE => Message::Live(serde_json::from_slice::<LiveRecord>(body)?),
        msgtype::SUBSCRIBE => {
            Message::Subscribe(serde_json::from_slice::<SubscribeRequest>(body)?)
        }
        msgtype::AGGREGATE => {
            Message::Aggregate(serde_json::from_slice::<AggregateRequest>(body)?)
        }
        msgtype::PERCENTILE => {
            Message::Percentile(serde_json::from_slice::<PercentileRequest>(body)?)
        }
        msgtype::QUERY_CANCELLED => {
            Message::QueryCancelled(serde_json::from_slice::<CancelNotice>(body)?)
        }
        msgtype::PUSH => Message::Push(serde_json::from_slice::<PushCheckpoint>(body)?),
        msgtype::VERSION_CHECK => {
            Message::VersionCheck(serde_json::from_slice::<VersionCheck>(body)?)
        }
        other => return Err(ProtocolError::UnknownType(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reqtype, AggregatorSpec, CancelContext, Labels};
    use nntsc_core::{Collection, DataRow, FieldValue};

    fn round_trip(message: Message) -> Message {
        let mut codec = NntscCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decoder left bytes behind");
        decoded
    }

    fn sample_row() -> DataRow {
        let mut row = DataRow::new();
        row.insert("timestamp".to_string(), 1000i64.into());
        row.insert("stream_id".to_string(), 1i64.into());
        row.insert("median".to_string(), 130i64.into());
        row.insert("lossrate".to_string(), 0.25.into());
        row.insert(
            "rtts".to_string(),
            FieldValue::IntegerArray(vec![Some(120), Some(130), None]),
        );
        row
    }

    #[test]
    fn every_message_type_round_trips() {
        let labels = Labels::from([("A".to_string(), vec![1, 2])]);

        let messages = vec![
            Message::Request(Request {
                reqtype: reqtype::STREAMS,
                collection: 3,
                start: 250,
            }),
            Message::Collections(CollectionList {
                collections: vec![Collection {
                    id: 1,
                    module: "amp".into(),
                    modsubtype: "icmp".into(),
                    streamtable: "streams_amp_icmp".into(),
                    datatable: "data_amp_icmp".into(),
                }],
            }),
            Message::Schemas(SchemaDescription {
                collection: "amp_icmp".into(),
                stream_schema: vec!["stream_id".into(), "source".into()],
                data_schema: vec!["stream_id".into(), "timestamp".into(), "median".into()],
            }),
            Message::Streams(StreamBatch {
                collection: "amp_icmp".into(),
                more: true,
                streams: vec![sample_row()],
            }),
            Message::History(HistoryBlock {
                collection: "amp_icmp".into(),
                label: "A".into(),
                data: vec![sample_row(), sample_row()],
                more: false,
                binsize: 300,
            }),
            Message::Live(LiveRecord {
                collection: "amp_icmp".into(),
                stream_id: 1,
                timestamp: 1120,
                data: sample_row(),
            }),
            Message::Subscribe(SubscribeRequest {
                collection: "amp_icmp".into(),
                start: 1000,
                end: 0,
                columns: vec!["median".into()],
                labels: labels.clone(),
                aggregators: vec![],
            }),
            Message::Aggregate(AggregateRequest {
                collection: 1,
                start: 1000,
                end: 1120,
                labels: labels.clone(),
                columns: vec!["median".into()],
                groups: vec![],
                binsize: 60,
                aggregator: AggregatorSpec::Single("avg".into()),
            }),
            Message::Percentile(PercentileRequest {
                collection: 1,
                start: 1000,
                end: 1120,
                labels: labels.clone(),
                binsize: 60,
                ntile_columns: vec!["median".into()],
                other_columns: vec!["loss".into()],
                ntile_aggregator: "avg".into(),
                other_aggregator: "max".into(),
            }),
            Message::QueryCancelled(CancelNotice {
                request: msgtype::HISTORY,
                context: CancelContext::History {
                    collection: "amp_icmp".into(),
                    labels,
                    start: 1000,
                    end: 1120,
                    more: true,
                },
            }),
            Message::Push(PushCheckpoint { collection: 1, timestamp: 1120 }),
            Message::VersionCheck(VersionCheck { version: 1 }),
        ];

        for message in messages {
            let expected = message.clone();
            assert_eq!(round_trip(message), expected);
        }
    }

    #[test]
    fn request_body_is_twelve_bytes() {
        let mut codec = NntscCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::Request(Request {
                    reqtype: reqtype::COLLECTIONS,
                    collection: 0,
                    start: 0,
                }),
                &mut buf,
            )
            .unwrap();
        assert_eq!(buf.len(), 4 + 12);
        assert_eq!(&buf[..4], &[1, msgtype::REQUEST, 0, 12]);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = NntscCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Message::VersionCheck(VersionCheck { version: 1 }), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut short_body = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut short_body).unwrap().is_none());

        let mut whole = BytesMut::from(&full[..]);
        assert!(codec.decode(&mut whole).unwrap().is_some());
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut codec = NntscCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::VersionCheck(VersionCheck { version: 1 }), &mut buf)
            .unwrap();
        codec
            .encode(Message::Push(PushCheckpoint { collection: 2, timestamp: 5 }), &mut buf)
            .unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::VersionCheck(_))
        ));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Message::Push(_))));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_header_version_is_rejected() {
        let mut codec = NntscCodec::new();
        let mut buf = BytesMut::from(&[9u8, msgtype::PUSH, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::HeaderVersion(9))
        ));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut codec = NntscCodec::new();
        let mut buf = BytesMut::from(&[1u8, 200, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownType(200))
        ));
    }

    #[test]
    fn history_bodies_are_compressed() {
        // A run of identical rows should shrink well below the JSON
        // size, and certainly below the frame limit.
        let block = HistoryBlock {
            collection: "amp_icmp".into(),
            label: "A".into(),
            data: (0..500).map(|_| sample_row()).collect(),
            more: true,
            binsize: 60,
        };
        let json_len = serde_json::to_vec(&block).unwrap().len();
        let body = encode_body(&Message::History(block)).unwrap();
        assert!(body.len() < json_len / 4, "{} vs {json_len}", body.len());
    }
}
