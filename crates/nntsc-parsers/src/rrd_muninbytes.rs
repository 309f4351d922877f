//! Munin byte-counter RRD parser: one per-interface, per-direction
//! byte count per sample.

use std::collections::HashMap;

use async_trait::async_trait;

use nntsc_core::{
    CollectionSpec, ColumnSpec, ColumnType, DataRow, EventSender, IndexSpec, StoreError,
    TableDefinitions, Timestamp,
};
use nntsc_store::DbInsert;

use crate::base::ParserCore;
use crate::RrdParser;

const STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("filename", ColumnType::Varchar, false),
    ColumnSpec::new("switch", ColumnType::Varchar, false),
    ColumnSpec::new("interface", ColumnType::Varchar, false),
    ColumnSpec::new("interfacelabel", ColumnType::Varchar, true),
    ColumnSpec::new("direction", ColumnType::Varchar, false),
    ColumnSpec::with_default("minres", ColumnType::Integer, false, "300"),
    ColumnSpec::with_default("highrows", ColumnType::Integer, false, "1008"),
];

const UNIQUE_COLUMNS: &[&str] = &["filename", "interface", "switch", "direction"];

const STREAM_INDEXES: &[IndexSpec] = &[IndexSpec { columns: &["switch"] }];

const DATA_COLUMNS: &[ColumnSpec] = &[ColumnSpec::new("bytes", ColumnType::BigInt, true)];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "rrd",
    modsubtype: "muninbytes",
    streamtable: "streams_rrd_muninbytes",
    datatable: "data_rrd_muninbytes",
    tables: TableDefinitions {
        stream_columns: STREAM_COLUMNS,
        unique_columns: UNIQUE_COLUMNS,
        stream_indexes: STREAM_INDEXES,
        data_columns: DATA_COLUMNS,
        data_indexes: &[],
    },
    rollups: &[],
};

pub struct RrdMuninbytesParser {
    core: ParserCore,
}

impl RrdMuninbytesParser {
    pub fn new() -> Self {
        RrdMuninbytesParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for RrdMuninbytesParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RrdParser for RrdMuninbytesParser {
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
        for required in ["file", "switch", "interface", "direction", "name"] {
            if !params.contains_key(required) {
                return Err(StoreError::Data(format!(
                    "missing '{required}' parameter for muninbytes RRD"
                )));
            }
        }

        let mut props = DataRow::new();
        props.insert("filename".to_string(), params["file"].as_str().into());
        props.insert("switch".to_string(), params["switch"].as_str().into());
        props.insert("interface".to_string(), params["interface"].as_str().into());
        props.insert("direction".to_string(), params["direction"].as_str().into());
        if let Some(label) = params.get("interfacelabel") {
            props.insert("interfacelabel".to_string(), label.as_str().into());
        }
        for numeric in ["minres", "highrows"] {
            if let Some(value) = params.get(numeric) {
                let parsed: i64 = value.parse().map_err(|_| {
                    StoreError::Data(format!("bad '{numeric}' value for muninbytes RRD"))
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
        let mut row = DataRow::new();
        row.insert(
            "bytes".to_string(),
            cells.first().copied().flatten().map(|v| v as i64).into(),
        );
        self.core.insert_data(db, bus, stream_id, ts, row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nntsc_core::FieldValue;

    #[test]
    fn key_round_trips_through_props() {
        let mut props = DataRow::new();
        props.insert("filename".to_string(), "/var/lib/munin/sw1.rrd".into());
        props.insert("switch".to_string(), "sw1".into());
        props.insert("interface".to_string(), "ge-0/0/1".into());
        props.insert("direction".to_string(), "received".into());

        let core = ParserCore::new(SPEC);
        assert_eq!(
            core.key_from_row(&props),
            vec!["/var/lib/munin/sw1.rrd", "ge-0/0/1", "sw1", "received"]
        );
    }

    #[test]
    fn first_cell_becomes_bytes() {
        let cells = vec![Some(123456.7)];
        assert_eq!(
            FieldValue::from(cells.first().copied().flatten().map(|v| v as i64)),
            FieldValue::Integer(123456)
        );
    }
}
