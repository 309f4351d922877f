//! # NNTSC Protocol - Framing and Message Taxonomy
//!
//! Every message on the wire is a 4-byte header followed by a body:
//!
//! ```text
//! header: version:u8 | type:u8 | body_len:u16   (big-endian)
//! body:   body_len bytes
//! ```
//!
//! The protocol version is 1 and the type constants in [`msgtype`] are
//! stable. Bodies are JSON encodings of the structs below, with two
//! exceptions:
//!
//! - `REQUEST` is a fixed 12-byte struct,
//!   `reqtype:u32 | collection:u32 | start:u32` big-endian
//! - `HISTORY` bodies are zlib-compressed JSON, since history chunks
//!   dominate the bytes on the wire
//!
//! The JSON body of each message is the serde encoding of its struct:
//! e.g. a `STREAMS` body reads
//! `{"collection":"amp_icmp","more":true,"streams":[{...}]}` and a
//! `VERSION_CHECK` body reads `{"version":1}`. Field values reuse the
//! [`nntsc_core::FieldValue`] JSON shapes (null, number, string, or an
//! array of numbers/strings).

pub mod client;
pub mod codec;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use nntsc_core::{Collection, DataRow, Timestamp};

pub use client::{NntscClient, StreamSelection};
pub use codec::{NntscCodec, ProtocolError};

/// Wire protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message type constants. Stable; never renumber.
pub mod msgtype {
    pub const REQUEST: u8 = 1;
    pub const COLLECTIONS: u8 = 2;
    pub const SCHEMAS: u8 = 3;
    pub const STREAMS: u8 = 4;
    pub const HISTORY: u8 = 5;
    pub const LIVE: u8 = 6;
    pub const SUBSCRIBE: u8 = 7;
    pub const AGGREGATE: u8 = 8;
    pub const PERCENTILE: u8 = 9;
    pub const QUERY_CANCELLED: u8 = 10;
    pub const PUSH: u8 = 11;
    pub const VERSION_CHECK: u8 = 12;
}

/// Request subtypes carried in a `REQUEST` body.
pub mod reqtype {
    pub const COLLECTIONS: u32 = 0;
    pub const SCHEMAS: u32 = 1;
    pub const STREAMS: u32 = 2;
    /// Kept for wire stability; requests of this type are always
    /// refused.
    pub const ACTIVE_STREAMS: u32 = 3;
}

/// Stream ids grouped under client-chosen labels.
pub type Labels = HashMap<String, Vec<i32>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Collections(CollectionList),
    Schemas(SchemaDescription),
    Streams(StreamBatch),
    History(HistoryBlock),
    Live(LiveRecord),
    Subscribe(SubscribeRequest),
    Aggregate(AggregateRequest),
    Percentile(PercentileRequest),
    QueryCancelled(CancelNotice),
    Push(PushCheckpoint),
    VersionCheck(VersionCheck),
}

impl Message {
    pub fn msgtype(&self) -> u8 {
        match self {
            Message::Request(_) => msgtype::REQUEST,
            Message::Collections(_) => msgtype::COLLECTIONS,
            Message::Schemas(_) => msgtype::SCHEMAS,
            Message::Streams(_) => msgtype::STREAMS,
            Message::History(_) => msgtype::HISTORY,
            Message::Live(_) => msgtype::LIVE,
            Message::Subscribe(_) => msgtype::SUBSCRIBE,
            Message::Aggregate(_) => msgtype::AGGREGATE,
            Message::Percentile(_) => msgtype::PERCENTILE,
            Message::QueryCancelled(_) => msgtype::QUERY_CANCELLED,
            Message::Push(_) => msgtype::PUSH,
            Message::VersionCheck(_) => msgtype::VERSION_CHECK,
        }
    }
}

/// The fixed-size catalogue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub reqtype: u32,
    pub collection: u32,
    /// For `STREAMS` requests, the stream id to page from.
    pub start: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionCheck {
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionList {
    pub collections: Vec<Collection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub collection: String,
    pub stream_schema: Vec<String>,
    pub data_schema: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamBatch {
    pub collection: String,
    /// More `STREAMS` messages follow for the same request.
    pub more: bool,
    pub streams: Vec<DataRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBlock {
    pub collection: String,
    /// The label these rows belong to. Legacy clients that subscribed
    /// with plain stream lists see the stringified stream id here.
    pub label: String,
    pub data: Vec<DataRow>,
    /// More history follows for this label.
    pub more: bool,
    pub binsize: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRecord {
    pub collection: String,
    pub stream_id: i32,
    pub timestamp: Timestamp,
    pub data: DataRow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub collection: String,
    pub start: Timestamp,
    /// Zero means open-ended: history first, live updates afterwards.
    pub end: Timestamp,
    pub columns: Vec<String>,
    pub labels: Labels,
    #[serde(default)]
    pub aggregators: Vec<String>,
}

/// One aggregation function for every column, or one per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregatorSpec {
    Single(String),
    PerColumn(Vec<String>),
}

impl AggregatorSpec {
    /// Pair each column with its aggregation function.
    pub fn apply(&self, columns: &[String]) -> Vec<(String, String)> {
        match self {
            AggregatorSpec::Single(func) => columns
                .iter()
                .map(|col| (col.clone(), func.clone()))
                .collect(),
            AggregatorSpec::PerColumn(funcs) => columns
                .iter()
                .zip(funcs.iter())
                .map(|(col, func)| (col.clone(), func.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub collection: i32,
    pub start: Timestamp,
    pub end: Timestamp,
    pub labels: Labels,
    pub columns: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    pub binsize: i64,
    pub aggregator: AggregatorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileRequest {
    pub collection: i32,
    pub start: Timestamp,
    pub end: Timestamp,
    pub labels: Labels,
    pub binsize: i64,
    pub ntile_columns: Vec<String>,
    #[serde(default)]
    pub other_columns: Vec<String>,
    pub ntile_aggregator: String,
    pub other_aggregator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushCheckpoint {
    pub collection: i32,
    pub timestamp: Timestamp,
}

/// Sent when a request cannot be completed; carries enough context for
/// the client to resume where the server stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelNotice {
    /// The message type of the cancelled request.
    pub request: u8,
    #[serde(default)]
    pub context: CancelContext,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelContext {
    #[default]
    None,
    Schemas {
        collection: i32,
    },
    Streams {
        collection: i32,
        /// The highest stream id delivered before the failure.
        boundary: i32,
    },
    History {
        collection: String,
        labels: Labels,
        start: Timestamp,
        end: Timestamp,
        /// Whether more history was still owed when the query died.
        more: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_spec_pairs_columns() {
        let columns = vec!["median".to_string(), "loss".to_string()];

        let single = AggregatorSpec::Single("avg".to_string());
        assert_eq!(
            single.apply(&columns),
            vec![
                ("median".to_string(), "avg".to_string()),
                ("loss".to_string(), "avg".to_string())
            ]
        );

        let per_column =
            AggregatorSpec::PerColumn(vec!["avg".to_string(), "sum".to_string()]);
        assert_eq!(
            per_column.apply(&columns),
            vec![
                ("median".to_string(), "avg".to_string()),
                ("loss".to_string(), "sum".to_string())
            ]
        );
    }

    #[test]
    fn cancel_context_json_is_tagged() {
        let notice = CancelNotice {
            request: msgtype::STREAMS,
            context: CancelContext::Streams { collection: 3, boundary: 120 },
        };
        let json = serde_json::to_string(&notice).unwrap();
        assert!(json.contains("\"kind\":\"streams\""), "{json}");
        let back: CancelNotice = serde_json::from_str(&json).unwrap();
        assert_eq!(back, notice);
    }
}
