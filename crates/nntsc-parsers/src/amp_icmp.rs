//! ICMP latency test parser. Each payload carries one result per
//! probed target; the individual ping RTTs are folded into a median
//! plus a loss rate, with the raw RTT list kept alongside.

use async_trait::async_trait;
use serde::Deserialize;

use nntsc_core::{
    CollectionSpec, ColumnSpec, ColumnType, DataRow, EventSender, FieldValue, IndexSpec, Payload,
    Rollup, StoreError, TableDefinitions, Timestamp,
};
use nntsc_store::DbInsert;

use crate::base::{address_family, median_of_sorted, ParserCore};
use crate::Parser;

const STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("destination", ColumnType::Varchar, false),
    ColumnSpec::new("family", ColumnType::Varchar, false),
    ColumnSpec::new("packet_size", ColumnType::Varchar, false),
    ColumnSpec::new("address", ColumnType::Inet, false),
];

const UNIQUE_COLUMNS: &[&str] = &["source", "destination", "packet_size", "address"];

const STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["destination"] },
];

const DATA_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("median", ColumnType::Integer, true),
    ColumnSpec::new("packet_size", ColumnType::SmallInt, true),
    ColumnSpec::new("loss", ColumnType::SmallInt, true),
    ColumnSpec::new("results", ColumnType::SmallInt, true),
    ColumnSpec::new("icmperrors", ColumnType::SmallInt, true),
    ColumnSpec::new("rtts", ColumnType::IntegerArray, true),
    ColumnSpec::new("lossrate", ColumnType::Double, true),
];

const ROLLUPS: &[Rollup] = &[
    Rollup { column: "median", aggregate: "mean", label: "median_avg" },
    Rollup { column: "median", aggregate: "stddev", label: "median_stddev" },
    Rollup { column: "median", aggregate: "count", label: "median_count" },
    Rollup { column: "loss", aggregate: "sum", label: "loss_sum" },
];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "amp",
    modsubtype: "icmp",
    streamtable: "streams_amp_icmp",
    datatable: "data_amp_icmp",
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
struct IcmpResult {
    target: String,
    address: String,
    #[serde(default)]
    packet_size: Option<i64>,
    #[serde(default)]
    random: bool,
    #[serde(default)]
    rtts: Vec<Option<i64>>,
    #[serde(default)]
    loss: Option<i64>,
    #[serde(default)]
    icmperrors: Option<i64>,
}

impl IcmpResult {
    fn size_str(&self) -> Result<String, StoreError> {
        if self.random {
            return Ok("random".to_string());
        }
        self.packet_size
            .map(|s| s.to_string())
            .ok_or_else(|| StoreError::Data("no packet size specified in icmp result".to_string()))
    }
}

pub struct AmpIcmpParser {
    core: ParserCore,
}

impl AmpIcmpParser {
    pub fn new() -> Self {
        AmpIcmpParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for AmpIcmpParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for AmpIcmpParser {
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
            return Err(StoreError::Data("icmp payload must be a test report".to_string()));
        };

        let mut touched = Vec::new();
        for value in results {
            let result: IcmpResult = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Data(format!("malformed icmp result: {e}")))?;
            let size = result.size_str()?;

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
                        "icmp {}:{}:{}:{}",
                        source, result.target, result.address, size
                    );
                    let props = stream_props(source, &result, &size);
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

fn stream_props(source: &str, result: &IcmpResult, size: &str) -> DataRow {
    let mut props = DataRow::new();
    props.insert("source".to_string(), source.into());
    props.insert("destination".to_string(), result.target.as_str().into());
    props.insert("family".to_string(), address_family(&result.address).into());
    props.insert("packet_size".to_string(), size.into());
    props.insert("address".to_string(), result.address.as_str().into());
    props
}

fn data_row(result: &IcmpResult) -> DataRow {
    let mut valid: Vec<i64> = result.rtts.iter().filter_map(|r| *r).collect();
    valid.sort_unstable();

    let loss = result.loss.unwrap_or(0).max(0);
    let icmperrors = result.icmperrors.unwrap_or(0).max(0);
    let results_count = valid.len() as i64 + loss;

    // Losses and errors become trailing nulls, appended after the
    // median so they cannot skew it.
    let mut rtts: Vec<Option<i64>> = valid.iter().copied().map(Some).collect();
    rtts.extend(std::iter::repeat(None).take(loss as usize));
    rtts.extend(std::iter::repeat(None).take(icmperrors as usize));

    let lossrate = if results_count > 0 {
        Some(loss as f64 / results_count as f64)
    } else {
        None
    };

    let mut row = DataRow::new();
    row.insert("median".to_string(), median_of_sorted(&valid).into());
    row.insert(
        "packet_size".to_string(),
        if result.random { FieldValue::Null } else { result.packet_size.into() },
    );
    row.insert("loss".to_string(), loss.into());
    row.insert("results".to_string(), results_count.into());
    row.insert("icmperrors".to_string(), icmperrors.into());
    row.insert("rtts".to_string(), FieldValue::IntegerArray(rtts));
    row.insert("lossrate".to_string(), lossrate.into());
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(json: &str) -> IcmpResult {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn clean_measurement_round() {
        let row = data_row(&result(
            r#"{"target": "10.0.0.1", "address": "10.0.0.1",
                "packet_size": 84, "rtts": [120, 130, 140], "loss": 0}"#,
        ));
        assert_eq!(row["median"], FieldValue::Integer(130));
        assert_eq!(row["loss"], FieldValue::Integer(0));
        assert_eq!(row["results"], FieldValue::Integer(3));
        assert_eq!(row["lossrate"], FieldValue::Float(0.0));
        assert_eq!(
            row["rtts"],
            FieldValue::IntegerArray(vec![Some(120), Some(130), Some(140)])
        );
    }

    #[test]
    fn losses_append_nulls_and_set_lossrate() {
        let row = data_row(&result(
            r#"{"target": "a", "address": "10.0.0.1", "packet_size": 84,
                "rtts": [100, null, 200], "loss": 1, "icmperrors": 1}"#,
        ));
        assert_eq!(row["median"], FieldValue::Integer(150));
        assert_eq!(row["results"], FieldValue::Integer(3));
        assert_eq!(row["lossrate"], FieldValue::Float(1.0 / 3.0));
        assert_eq!(
            row["rtts"],
            FieldValue::IntegerArray(vec![Some(100), Some(200), None, None])
        );
    }

    #[test]
    fn total_loss_has_no_median() {
        let row = data_row(&result(
            r#"{"target": "a", "address": "10.0.0.1", "packet_size": 84,
                "rtts": [], "loss": 4}"#,
        ));
        assert_eq!(row["median"], FieldValue::Null);
        assert_eq!(row["lossrate"], FieldValue::Float(1.0));
        assert_eq!(row["rtts"], FieldValue::IntegerArray(vec![None; 4]));
    }

    #[test]
    fn random_sized_probes_key_as_random() {
        let r = result(
            r#"{"target": "a", "address": "10.0.0.1", "random": true, "rtts": [5]}"#,
        );
        assert_eq!(r.size_str().unwrap(), "random");
        assert_eq!(data_row(&r)["packet_size"], FieldValue::Null);
    }

    #[test]
    fn missing_packet_size_is_a_data_error() {
        let r = result(r#"{"target": "a", "address": "10.0.0.1", "rtts": []}"#);
        assert!(matches!(r.size_str(), Err(StoreError::Data(_))));
    }

    #[test]
    fn existing_streams_are_recognized_by_key() {
        let mut parser = AmpIcmpParser::new();
        let mut stream = DataRow::new();
        stream.insert("stream_id".to_string(), 7i64.into());
        stream.insert("source".to_string(), "probeA".into());
        stream.insert("destination".to_string(), "10.0.0.1".into());
        stream.insert("packet_size".to_string(), "84".into());
        stream.insert("address".to_string(), "10.0.0.1".into());
        stream.insert("family".to_string(), "ipv4".into());
        parser.register_existing(&stream);

        let key = vec![
            "probeA".to_string(),
            "10.0.0.1".to_string(),
            "84".to_string(),
            "10.0.0.1".to_string(),
        ];
        assert_eq!(parser.core.known_stream(&key), Some(7));
    }
}
