//! TCP ping test parser. Unlike the other active tests, one payload
//! carries many individual ping measurements which are aggregated into
//! a single row per stream: sorted RTTs reduced to a median, losses and
//! ICMP errors appended as nulls afterwards, and a loss rate over the
//! number of real results.

use std::collections::HashMap;

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
    ColumnSpec::new("port", ColumnType::Integer, false),
    ColumnSpec::new("family", ColumnType::Varchar, false),
    ColumnSpec::new("packet_size", ColumnType::Varchar, false),
];

const UNIQUE_COLUMNS: &[&str] = &["source", "destination", "port", "family", "packet_size"];

const STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["destination"] },
    IndexSpec { columns: &["port"] },
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
    Rollup { column: "loss", aggregate: "sum", label: "loss_sum" },
];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "amp",
    modsubtype: "tcpping",
    streamtable: "streams_amp_tcpping",
    datatable: "data_amp_tcpping",
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
struct TcppingResult {
    target: String,
    address: String,
    port: Option<i64>,
    #[serde(default)]
    random: bool,
    #[serde(default)]
    packet_size: Option<i64>,
    #[serde(default)]
    rtt: Option<i64>,
    #[serde(default)]
    loss: Option<i64>,
    #[serde(default)]
    icmptype: Option<i64>,
}

/// Accumulated state for one stream within a payload.
#[derive(Debug, Default)]
struct PingStats {
    loss: Option<i64>,
    rtts: Vec<i64>,
    icmperrors: Option<i64>,
    results: Option<i64>,
    packet_size: Option<i64>,
    random: bool,
}

impl PingStats {
    fn update(&mut self, result: &TcppingResult) {
        if let Some(icmptype) = result.icmptype {
            self.icmperrors = add_opt(self.icmperrors, (icmptype != 0) as i64);
        }
        if let Some(loss) = result.loss {
            self.loss = add_opt(self.loss, loss);
        }
        if let Some(rtt) = result.rtt {
            self.rtts.push(rtt);
        }
        // A real measurement happened when there was an rtt or a loss.
        if result.rtt.unwrap_or(0) != 0 || result.loss.unwrap_or(0) != 0 {
            self.results = add_opt(self.results, 1);
        }
    }

    fn into_row(mut self) -> DataRow {
        self.rtts.sort_unstable();
        let median = median_of_sorted(&self.rtts);

        // Null entries for lost and errored pings go in after the
        // median so they cannot distort it.
        let mut rtts: Vec<Option<i64>> = self.rtts.iter().copied().map(Some).collect();
        rtts.extend(std::iter::repeat(None).take(self.loss.unwrap_or(0).max(0) as usize));
        rtts.extend(std::iter::repeat(None).take(self.icmperrors.unwrap_or(0).max(0) as usize));

        let lossrate = match self.results {
            Some(results) if results > 0 => {
                Some(self.loss.unwrap_or(0) as f64 / results as f64)
            }
            _ => None,
        };

        let mut row = DataRow::new();
        row.insert("median".to_string(), median.into());
        row.insert(
            "packet_size".to_string(),
            if self.random { FieldValue::Null } else { self.packet_size.into() },
        );
        row.insert("loss".to_string(), self.loss.into());
        row.insert("results".to_string(), self.results.into());
        row.insert("icmperrors".to_string(), self.icmperrors.into());
        row.insert("rtts".to_string(), FieldValue::IntegerArray(rtts));
        row.insert("lossrate".to_string(), lossrate.into());
        row
    }
}

fn add_opt(acc: Option<i64>, value: i64) -> Option<i64> {
    Some(acc.unwrap_or(0) + value)
}

pub struct AmpTcppingParser {
    core: ParserCore,
}

impl AmpTcppingParser {
    pub fn new() -> Self {
        AmpTcppingParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for AmpTcppingParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for AmpTcppingParser {
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
            return Err(StoreError::Data("tcpping payload must be a test report".to_string()));
        };

        let mut observed: HashMap<i32, PingStats> = HashMap::new();
        for value in results {
            let result: TcppingResult = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Data(format!("malformed tcpping result: {e}")))?;
            let port = result
                .port
                .ok_or_else(|| StoreError::Data("no port specified in tcpping result".to_string()))?;
            let size = if result.random {
                "random".to_string()
            } else {
                result
                    .packet_size
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        StoreError::Data("no packet size specified in tcpping result".to_string())
                    })?
            };
            let family = address_family(&result.address);

            let key = vec![
                source.to_string(),
                result.target.clone(),
                port.to_string(),
                family.to_string(),
                size.clone(),
            ];
            let stream_id = match self.core.known_stream(&key) {
                Some(id) => id,
                None => {
                    let name = format!(
                        "tcpping {}:{}:{}:{}:{}",
                        source, result.target, port, family, size
                    );
                    let mut props = DataRow::new();
                    props.insert("source".to_string(), source.into());
                    props.insert("destination".to_string(), result.target.as_str().into());
                    props.insert("port".to_string(), port.into());
                    props.insert("family".to_string(), family.into());
                    props.insert("packet_size".to_string(), size.as_str().into());
                    self.core.stream_for(db, bus, key, name, props, ts).await?
                }
            };

            let stats = observed.entry(stream_id).or_default();
            if stats.packet_size.is_none() {
                stats.packet_size = result.packet_size;
                stats.random = result.random;
            }
            stats.update(&result);
        }

        let mut touched: Vec<i32> = observed.keys().copied().collect();
        touched.sort_unstable();
        for (stream_id, stats) in observed {
            self.core
                .insert_data(db, bus, stream_id, ts, stats.into_row())
                .await?;
        }

        db.update_last_timestamp(&touched, ts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(rtt: Option<i64>, loss: i64, icmptype: Option<i64>) -> TcppingResult {
        TcppingResult {
            target: "www".into(),
            address: "10.0.0.1".into(),
            port: Some(443),
            random: false,
            packet_size: Some(64),
            rtt,
            loss: Some(loss),
            icmptype,
        }
    }

    #[test]
    fn pings_aggregate_into_one_row() {
        let mut stats = PingStats::default();
        stats.packet_size = Some(64);
        for result in [
            ping(Some(300), 0, None),
            ping(Some(100), 0, None),
            ping(Some(200), 0, None),
            ping(None, 1, None),
            ping(None, 0, Some(3)),
        ] {
            stats.update(&result);
        }

        let row = stats.into_row();
        assert_eq!(row["median"], FieldValue::Integer(200));
        assert_eq!(row["loss"], FieldValue::Integer(1));
        assert_eq!(row["icmperrors"], FieldValue::Integer(1));
        // Three rtts plus one loss; the errored ping had neither rtt
        // nor loss so it is not a result.
        assert_eq!(row["results"], FieldValue::Integer(4));
        assert_eq!(row["lossrate"], FieldValue::Float(0.25));
        assert_eq!(
            row["rtts"],
            FieldValue::IntegerArray(vec![Some(100), Some(200), Some(300), None, None])
        );
    }

    #[test]
    fn no_measurements_means_null_lossrate() {
        let stats = PingStats::default();
        let row = stats.into_row();
        assert_eq!(row["median"], FieldValue::Null);
        assert_eq!(row["results"], FieldValue::Null);
        assert_eq!(row["lossrate"], FieldValue::Null);
    }

    #[test]
    fn zero_icmptype_counts_as_no_error() {
        let mut stats = PingStats::default();
        stats.update(&ping(Some(100), 0, Some(0)));
        let row = stats.into_row();
        assert_eq!(row["icmperrors"], FieldValue::Integer(0));
    }
}
