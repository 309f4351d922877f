//! DNS latency test parser. One stream per combination of query and
//! server address; each result carries a single response time.

use async_trait::async_trait;
use serde::Deserialize;

use nntsc_core::{
    CollectionSpec, ColumnSpec, ColumnType, DataRow, EventSender, IndexSpec, Payload, Rollup,
    StoreError, TableDefinitions, Timestamp,
};
use nntsc_store::DbInsert;

use crate::base::ParserCore;
use crate::Parser;

const STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("destination", ColumnType::Varchar, false),
    ColumnSpec::new("instance", ColumnType::Varchar, false),
    ColumnSpec::new("address", ColumnType::Inet, false),
    ColumnSpec::new("query", ColumnType::Varchar, false),
    ColumnSpec::new("query_type", ColumnType::Varchar, false),
    ColumnSpec::new("query_class", ColumnType::Varchar, false),
    ColumnSpec::new("udp_payload_size", ColumnType::Integer, false),
    ColumnSpec::new("recurse", ColumnType::Bool, false),
    ColumnSpec::new("dnssec", ColumnType::Bool, false),
    ColumnSpec::new("nsid", ColumnType::Bool, false),
];

const UNIQUE_COLUMNS: &[&str] = &[
    "source",
    "destination",
    "query",
    "address",
    "query_type",
    "query_class",
    "udp_payload_size",
    "recurse",
    "dnssec",
    "nsid",
];

const STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["destination"] },
    IndexSpec { columns: &["query"] },
];

const DATA_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("rtt", ColumnType::Integer, true),
    ColumnSpec::new("query_len", ColumnType::SmallInt, true),
    ColumnSpec::new("response_size", ColumnType::Integer, true),
    ColumnSpec::new("total_answer", ColumnType::SmallInt, true),
    ColumnSpec::new("total_authority", ColumnType::SmallInt, true),
    ColumnSpec::new("total_additional", ColumnType::SmallInt, true),
    ColumnSpec::new("opcode", ColumnType::SmallInt, true),
    ColumnSpec::new("rcode", ColumnType::SmallInt, true),
    ColumnSpec::new("ttl", ColumnType::Integer, true),
];

const ROLLUPS: &[Rollup] = &[
    Rollup { column: "rtt", aggregate: "mean", label: "rtt_avg" },
    Rollup { column: "rtt", aggregate: "stddev", label: "rtt_stddev" },
    Rollup { column: "rtt", aggregate: "count", label: "rtt_count" },
];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "amp",
    modsubtype: "dns",
    streamtable: "streams_amp_dns",
    datatable: "data_amp_dns",
    tables: TableDefinitions {
        stream_columns: STREAM_COLUMNS,
        unique_columns: UNIQUE_COLUMNS,
        stream_indexes: STREAM_INDEXES,
        data_columns: DATA_COLUMNS,
        data_indexes: &[],
    },
    rollups: ROLLUPS,
};

#[derive(Debug, Deserialize)]
struct DnsResult {
    destination: String,
    #[serde(default)]
    instance: Option<String>,
    address: String,
    query: String,
    query_type: String,
    query_class: String,
    udp_payload_size: i64,
    #[serde(default)]
    recurse: bool,
    #[serde(default)]
    dnssec: bool,
    #[serde(default)]
    nsid: bool,
    #[serde(default)]
    rtt: Option<i64>,
    #[serde(default)]
    query_len: Option<i64>,
    #[serde(default)]
    response_size: Option<i64>,
    #[serde(default)]
    total_answer: Option<i64>,
    #[serde(default)]
    total_authority: Option<i64>,
    #[serde(default)]
    total_additional: Option<i64>,
    #[serde(default)]
    opcode: Option<i64>,
    #[serde(default)]
    rcode: Option<i64>,
    #[serde(default)]
    ttl: Option<i64>,
}

pub struct AmpDnsParser {
    core: ParserCore,
}

impl AmpDnsParser {
    pub fn new() -> Self {
        AmpDnsParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for AmpDnsParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for AmpDnsParser {
    fn spec(&self) -> CollectionSpec {
        SPEC
    }

    fn register_existing(&mut self, stream: &DataRow) {
        self.core.register_existing(stream);
    }

    async fn process(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        ts: Timestamp,
        payload: &Payload,
        source: &str,
    ) -> Result<(), StoreError> {
        let Payload::TestResults(results) = payload else {
            return Err(StoreError::Data("dns payload must be a test report".to_string()));
        };

        let mut touched = Vec::new();
        for value in results {
            let result: DnsResult = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Data(format!("malformed dns result: {e}")))?;

            let key = vec![
                source.to_string(),
                result.destination.clone(),
                result.query.clone(),
                result.address.clone(),
                result.query_type.clone(),
                result.query_class.clone(),
                result.udp_payload_size.to_string(),
                result.recurse.to_string(),
                result.dnssec.to_string(),
                result.nsid.to_string(),
            ];
            let stream_id = match self.core.known_stream(&key) {
                Some(id) => id,
                None => {
                    let name = format!(
                        "dns {}:{}:{} {}",
                        source, result.destination, result.query, result.query_type
                    );
                    let props = stream_props(source, &result);
                    self.core.stream_for(db, bus, key, name, props, ts).await?
                }
            };

            let mut row = DataRow::new();
            row.insert("rtt".to_string(), result.rtt.into());
            row.insert("query_len".to_string(), result.query_len.into());
            row.insert("response_size".to_string(), result.response_size.into());
            row.insert("total_answer".to_string(), result.total_answer.into());
            row.insert("total_authority".to_string(), result.total_authority.into());
            row.insert("total_additional".to_string(), result.total_additional.into());
            row.insert("opcode".to_string(), result.opcode.into());
            row.insert("rcode".to_string(), result.rcode.into());
            row.insert("ttl".to_string(), result.ttl.into());

            self.core.insert_data(db, bus, stream_id, ts, row).await?;
            touched.push(stream_id);
        }

        db.update_last_timestamp(&touched, ts).await
    }
}

fn stream_props(source: &str, result: &DnsResult) -> DataRow {
    let mut props = DataRow::new();
    props.insert("source".to_string(), source.into());
    props.insert("destination".to_string(), result.destination.as_str().into());
    // The instance defaults to the server name when the test does not
    // distinguish anycast instances.
    props.insert(
        "instance".to_string(),
        result
            .instance
            .clone()
            .unwrap_or_else(|| result.destination.clone())
            .into(),
    );
    props.insert("address".to_string(), result.address.as_str().into());
    props.insert("query".to_string(), result.query.as_str().into());
    props.insert("query_type".to_string(), result.query_type.as_str().into());
    props.insert("query_class".to_string(), result.query_class.as_str().into());
    props.insert("udp_payload_size".to_string(), result.udp_payload_size.into());
    props.insert("recurse".to_string(), result.recurse.into());
    props.insert("dnssec".to_string(), result.dnssec.into());
    props.insert("nsid".to_string(), result.nsid.into());
    props
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_key_round_trip() {
        let result: DnsResult = serde_json::from_str(
            r#"{"destination": "ns1.example.org", "address": "10.0.0.53",
                "query": "example.org", "query_type": "AAAA",
                "query_class": "IN", "udp_payload_size": 4096,
                "recurse": true, "dnssec": false, "nsid": false,
                "rtt": 1200, "total_answer": 1}"#,
        )
        .unwrap();

        let props = stream_props("probeA", &result);
        let core = ParserCore::new(SPEC);
        let key = core.key_from_row(&props);
        assert_eq!(key[0], "probeA");
        assert_eq!(key[1], "ns1.example.org");
        assert_eq!(key[2], "example.org");
        assert_eq!(key[6], "4096");
        assert_eq!(key[7], "true");
    }
}
