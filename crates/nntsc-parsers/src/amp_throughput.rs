//! TCP throughput test parser. Each result covers one transfer in one
//! direction; the achieved rate is derived from bytes and duration
//! when the test does not report it directly.

use async_trait::async_trait;
use serde::Deserialize;

use nntsc_core::{
    CollectionSpec, ColumnSpec, ColumnType, DataRow, EventSender, IndexSpec, Payload, Rollup,
    StoreError, TableDefinitions, Timestamp,
};
use nntsc_store::DbInsert;

use crate::base::{address_family, ParserCore};
use crate::Parser;

const STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("destination", ColumnType::Varchar, false),
    ColumnSpec::new("direction", ColumnType::Varchar, false),
    ColumnSpec::new("family", ColumnType::Varchar, false),
    ColumnSpec::new("address", ColumnType::Inet, false),
];

const UNIQUE_COLUMNS: &[&str] = &["source", "destination", "direction", "address"];

const STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["destination"] },
];

const DATA_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("duration", ColumnType::BigInt, true),
    ColumnSpec::new("bytes", ColumnType::BigInt, true),
    ColumnSpec::new("rate", ColumnType::Double, true),
    ColumnSpec::new("packets", ColumnType::BigInt, true),
];

const ROLLUPS: &[Rollup] = &[
    Rollup { column: "rate", aggregate: "mean", label: "rate_avg" },
    Rollup { column: "rate", aggregate: "stddev", label: "rate_stddev" },
];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "amp",
    modsubtype: "throughput",
    streamtable: "streams_amp_throughput",
    datatable: "data_amp_throughput",
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
struct ThroughputResult {
    target: String,
    address: String,
    direction: String,
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    bytes: Option<i64>,
    #[serde(default)]
    rate: Option<f64>,
    #[serde(default)]
    packets: Option<i64>,
}

pub struct AmpThroughputParser {
    core: ParserCore,
}

impl AmpThroughputParser {
    pub fn new() -> Self {
        AmpThroughputParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for AmpThroughputParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for AmpThroughputParser {
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
                "throughput payload must be a test report".to_string(),
            ));
        };

        let mut touched = Vec::new();
        for value in results {
            let result: ThroughputResult = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Data(format!("malformed throughput result: {e}")))?;

            let key = vec![
                source.to_string(),
                result.target.clone(),
                result.direction.clone(),
                result.address.clone(),
            ];
            let stream_id = match self.core.known_stream(&key) {
                Some(id) => id,
                None => {
                    let name = format!(
                        "throughput {}:{}:{}",
                        source, result.target, result.direction
                    );
                    let mut props = DataRow::new();
                    props.insert("source".to_string(), source.into());
                    props.insert("destination".to_string(), result.target.as_str().into());
                    props.insert("direction".to_string(), result.direction.as_str().into());
                    props.insert("family".to_string(), address_family(&result.address).into());
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

fn data_row(result: &ThroughputResult) -> DataRow {
    // Duration arrives in milliseconds; rate is bytes per second.
    let rate = result.rate.or_else(|| match (result.bytes, result.duration) {
        (Some(bytes), Some(duration)) if duration > 0 => {
            Some(bytes as f64 / (duration as f64 / 1000.0))
        }
        _ => None,
    });

    let mut row = DataRow::new();
    row.insert("duration".to_string(), result.duration.into());
    row.insert("bytes".to_string(), result.bytes.into());
    row.insert("rate".to_string(), rate.into());
    row.insert("packets".to_string(), result.packets.into());
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use nntsc_core::FieldValue;

    #[test]
    fn rate_is_derived_when_missing() {
        let result: ThroughputResult = serde_json::from_str(
            r#"{"target": "peer", "address": "10.0.0.2", "direction": "out",
                "duration": 10000, "bytes": 1000000}"#,
        )
        .unwrap();
        let row = data_row(&result);
        assert_eq!(row["rate"], FieldValue::Float(100000.0));
    }

    #[test]
    fn reported_rate_wins() {
        let result: ThroughputResult = serde_json::from_str(
            r#"{"target": "peer", "address": "10.0.0.2", "direction": "in",
                "duration": 10000, "bytes": 1000000, "rate": 12.5}"#,
        )
        .unwrap();
        let row = data_row(&result);
        assert_eq!(row["rate"], FieldValue::Float(12.5));
    }

    #[test]
    fn failed_transfer_keeps_nulls() {
        let result: ThroughputResult = serde_json::from_str(
            r#"{"target": "peer", "address": "10.0.0.2", "direction": "in"}"#,
        )
        .unwrap();
        let row = data_row(&result);
        assert_eq!(row["rate"], FieldValue::Null);
        assert_eq!(row["bytes"], FieldValue::Null);
    }
}
