//! Smokeping RRD parser. Smokeping reports ping medians in
//! milliseconds; everything is converted to microseconds on the way
//! in.

use std::collections::HashMap;

use async_trait::async_trait;

use nntsc_core::{
    CollectionSpec, ColumnSpec, ColumnType, DataRow, EventSender, FieldValue, IndexSpec, Rollup,
    StoreError, TableDefinitions, Timestamp,
};
use nntsc_store::DbInsert;

use crate::base::ParserCore;
use crate::RrdParser;

const STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("filename", ColumnType::Varchar, false),
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("host", ColumnType::Varchar, false),
    ColumnSpec::new("family", ColumnType::Varchar, false),
    ColumnSpec::with_default("minres", ColumnType::Integer, false, "300"),
    ColumnSpec::with_default("highrows", ColumnType::Integer, false, "1008"),
];

const UNIQUE_COLUMNS: &[&str] = &["filename", "source", "host", "family"];

const STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["host"] },
];

const DATA_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("loss", ColumnType::SmallInt, true),
    ColumnSpec::new("pingsent", ColumnType::SmallInt, true),
    ColumnSpec::new("median", ColumnType::Double, true),
    ColumnSpec::new("pings", ColumnType::DoubleArray, true),
    ColumnSpec::new("lossrate", ColumnType::Double, true),
];

const ROLLUPS: &[Rollup] = &[
    Rollup { column: "median", aggregate: "mean", label: "median_avg" },
    Rollup { column: "median", aggregate: "stddev", label: "median_stddev" },
    Rollup { column: "median", aggregate: "count", label: "median_count" },
    Rollup { column: "loss", aggregate: "sum", label: "loss_sum" },
];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "rrd",
    modsubtype: "smokeping",
    streamtable: "streams_rrd_smokeping",
    datatable: "data_rrd_smokeping",
    tables: TableDefinitions {
        stream_columns: STREAM_COLUMNS,
        unique_columns: UNIQUE_COLUMNS,
        stream_indexes: STREAM_INDEXES,
        data_columns: DATA_COLUMNS,
        data_indexes: &[],
    },
    rollups: ROLLUPS,
};

pub struct RrdSmokepingParser {
    core: ParserCore,
}

impl RrdSmokepingParser {
    pub fn new() -> Self {
        RrdSmokepingParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for RrdSmokepingParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RrdParser for RrdSmokepingParser {
    fn spec(&self) -> CollectionSpec {
        SPEC
    }

    fn register_existing(&mut self, stream: &DataRow) {
        self.core.register_existing(stream);
    }

    async fn insert_stream(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        params: &HashMap<String, String>,
    ) -> Result<i32, StoreError> {
        for required in ["file", "source", "host", "name", "family"] {
            if !params.contains_key(required) {
                return Err(StoreError::Data(format!(
                    "missing '{required}' parameter for smokeping RRD"
                )));
            }
        }

        let mut props = DataRow::new();
        props.insert("filename".to_string(), params["file"].as_str().into());
        props.insert("source".to_string(), params["source"].as_str().into());
        props.insert("host".to_string(), params["host"].as_str().into());
        props.insert("family".to_string(), params["family"].as_str().into());
        for numeric in ["minres", "highrows"] {
            if let Some(value) = params.get(numeric) {
                let parsed: i64 = value.parse().map_err(|_| {
                    StoreError::Data(format!("bad '{numeric}' value for smokeping RRD"))
                })?;
                props.insert(numeric.to_string(), parsed.into());
            }
        }

        let key = self.core.key_from_row(&props);
        if let Some(id) = self.core.known_stream(&key) {
            return Ok(id);
        }
        self.core
            .stream_for(db, bus, key, params["name"].clone(), props, 0)
            .await
    }

    async fn process_row(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        stream_id: i32,
        ts: Timestamp,
        cells: &[Option<f64>],
    ) -> Result<(), StoreError> {
        self.core
            .insert_data(db, bus, stream_id, ts, data_row(cells))
            .await
    }
}

/// Milliseconds to microseconds, rounded to six decimal places.
fn to_micros(value: f64) -> f64 {
    (value * 1000.0 * 1e6).round() / 1e6
}

fn data_row(cells: &[Option<f64>]) -> DataRow {
    let loss = cells.get(1).copied().flatten().map(|v| v as i64);
    let median = cells.get(2).copied().flatten().map(to_micros);

    let pings: Vec<Option<f64>> = cells
        .iter()
        .skip(3)
        .map(|cell| cell.map(to_micros))
        .collect();
    let sent = pings.len() as i64;

    let lossrate = match (sent, loss) {
        (0, _) | (_, None) => None,
        (sent, Some(loss)) => Some(loss as f64 / sent as f64),
    };

    let mut row = DataRow::new();
    row.insert("loss".to_string(), loss.into());
    row.insert("pingsent".to_string(), sent.into());
    row.insert("median".to_string(), median.into());
    row.insert("pings".to_string(), FieldValue::FloatArray(pings));
    row.insert("lossrate".to_string(), lossrate.into());
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_convert_to_microseconds() {
        // uptime, loss, median, then individual pings, all in ms.
        let cells = vec![
            Some(86400.0),
            Some(1.0),
            Some(0.0123),
            Some(0.012),
            Some(0.014),
            None,
        ];
        let row = data_row(&cells);
        assert_eq!(row["loss"], FieldValue::Integer(1));
        assert_eq!(row["median"], FieldValue::Float(12.3));
        assert_eq!(row["pingsent"], FieldValue::Integer(3));
        assert_eq!(
            row["pings"],
            FieldValue::FloatArray(vec![Some(12.0), Some(14.0), None])
        );
        assert_eq!(row["lossrate"], FieldValue::Float(1.0 / 3.0));
    }

    #[test]
    fn empty_fetch_row_is_all_null() {
        let row = data_row(&[None, None, None]);
        assert_eq!(row["loss"], FieldValue::Null);
        assert_eq!(row["median"], FieldValue::Null);
        assert_eq!(row["pingsent"], FieldValue::Integer(0));
        assert_eq!(row["lossrate"], FieldValue::Null);
        assert_eq!(row["pings"], FieldValue::FloatArray(vec![]));
    }
}
