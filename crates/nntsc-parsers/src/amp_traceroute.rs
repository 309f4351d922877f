//! Traceroute test parser. The hop list of each path is flattened into
//! two parallel arrays, the addresses as `inet[]` and the per-hop RTTs
//! as `integer[]`.

use async_trait::async_trait;
use serde::Deserialize;

use nntsc_core::{
    CollectionSpec, ColumnSpec, ColumnType, DataRow, EventSender, FieldValue, IndexSpec, Payload,
    StoreError, TableDefinitions, Timestamp,
};
use nntsc_store::DbInsert;

use crate::base::ParserCore;
use crate::Parser;

const STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("destination", ColumnType::Varchar, false),
    ColumnSpec::new("packet_size", ColumnType::Varchar, false),
    ColumnSpec::new("address", ColumnType::Inet, false),
];

const UNIQUE_COLUMNS: &[&str] = &["source", "destination", "packet_size", "address"];

const STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["destination"] },
];

const DATA_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("packet_size", ColumnType::Integer, true),
    ColumnSpec::new("length", ColumnType::SmallInt, true),
    ColumnSpec::new("error_type", ColumnType::SmallInt, true),
    ColumnSpec::new("error_code", ColumnType::SmallInt, true),
    ColumnSpec::new("hop_rtt", ColumnType::IntegerArray, false),
    ColumnSpec::new("path", ColumnType::InetArray, false),
];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "amp",
    modsubtype: "traceroute",
    streamtable: "streams_amp_traceroute",
    datatable: "data_amp_traceroute",
    tables: TableDefinitions {
        stream_columns: STREAM_COLUMNS,
        unique_columns: UNIQUE_COLUMNS,
        stream_indexes: STREAM_INDEXES,
        data_columns: DATA_COLUMNS,
        data_indexes: &[],
    },
    rollups: &[],
};

#[derive(Debug, Deserialize)]
struct Hop {
    address: String,
    #[serde(default)]
    rtt: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TracerouteResult {
    target: String,
    address: String,
    #[serde(default)]
    packet_size: Option<i64>,
    #[serde(default)]
    random: bool,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    error_type: Option<i64>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    hops: Vec<Hop>,
}

pub struct AmpTracerouteParser {
    core: ParserCore,
}

impl AmpTracerouteParser {
    pub fn new() -> Self {
        AmpTracerouteParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for AmpTracerouteParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for AmpTracerouteParser {
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
            return Err(StoreError::Data(
                "traceroute payload must be a test report".to_string(),
            ));
        };

        let mut touched = Vec::new();
        for value in results {
            let result: TracerouteResult = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Data(format!("malformed traceroute result: {e}")))?;
            let size = if result.random {
                "random".to_string()
            } else {
                result
                    .packet_size
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        StoreError::Data(
                            "no packet size specified in traceroute result".to_string(),
                        )
                    })?
            };

            let key = vec![
                source.to_string(),
                result.target.clone(),
                size.clone(),
                result.address.clone(),
            ];
            let stream_id = match self.core.known_stream(&key) {
                Some(id) => id,
                None => {
                    let name = format!(
                        "traceroute {}:{}:{}:{}",
                        source, result.target, result.address, size
                    );
                    let mut props = DataRow::new();
                    props.insert("source".to_string(), source.into());
                    props.insert("destination".to_string(), result.target.as_str().into());
                    props.insert("packet_size".to_string(), size.as_str().into());
                    props.insert("address".to_string(), result.address.as_str().into());
                    self.core.stream_for(db, bus, key, name, props, ts).await?
                }
            };

            self.core
                .insert_data(db, bus, stream_id, ts, data_row(&result))
                .await?;
            touched.push(stream_id);
        }

        db.update_last_timestamp(&touched, ts).await
    }
}

fn data_row(result: &TracerouteResult) -> DataRow {
    let path: Vec<String> = result.hops.iter().map(|h| h.address.clone()).collect();
    let hop_rtt: Vec<Option<i64>> = result.hops.iter().map(|h| h.rtt).collect();

    let mut row = DataRow::new();
    row.insert("packet_size".to_string(), result.packet_size.into());
    row.insert("length".to_string(), result.length.into());
    row.insert("error_type".to_string(), result.error_type.into());
    row.insert("error_code".to_string(), result.error_code.into());
    row.insert("hop_rtt".to_string(), FieldValue::IntegerArray(hop_rtt));
    row.insert("path".to_string(), FieldValue::TextArray(path));
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hops_flatten_into_parallel_arrays() {
        let result: TracerouteResult = serde_json::from_str(
            r#"{"target": "www", "address": "10.0.0.1", "packet_size": 60,
                "length": 3, "error_type": 0, "error_code": 0,
                "hops": [
                    {"address": "192.168.1.1", "rtt": 1},
                    {"address": "10.1.0.1", "rtt": null},
                    {"address": "10.0.0.1", "rtt": 12}
                ]}"#,
        )
        .unwrap();

        let row = data_row(&result);
        assert_eq!(
            row["path"],
            FieldValue::TextArray(vec![
                "192.168.1.1".into(),
                "10.1.0.1".into(),
                "10.0.0.1".into()
            ])
        );
        assert_eq!(
            row["hop_rtt"],
            FieldValue::IntegerArray(vec![Some(1), None, Some(12)])
        );
        assert_eq!(row["length"], FieldValue::Integer(3));
    }
}
