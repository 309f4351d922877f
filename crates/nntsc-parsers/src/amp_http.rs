//! HTTP page-fetch test parser. The measurement software has renamed a
//! few fields over time, so both spellings of the URL, the keep-alive
//! flag and the pipelining limit are accepted.

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
    ColumnSpec::new("max_connections", ColumnType::Integer, false),
    ColumnSpec::new("max_connections_per_server", ColumnType::SmallInt, false),
    ColumnSpec::new("max_persistent_connections_per_server", ColumnType::SmallInt, false),
    ColumnSpec::new("pipelining_max_requests", ColumnType::SmallInt, false),
    ColumnSpec::new("persist", ColumnType::Bool, false),
    ColumnSpec::new("pipelining", ColumnType::Bool, false),
    ColumnSpec::new("caching", ColumnType::Bool, false),
];

const UNIQUE_COLUMNS: &[&str] = &[
    "source",
    "destination",
    "max_connections",
    "max_connections_per_server",
    "max_persistent_connections_per_server",
    "pipelining_max_requests",
    "persist",
    "pipelining",
    "caching",
];

const STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["destination"] },
];

const DATA_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("server_count", ColumnType::Integer, true),
    ColumnSpec::new("object_count", ColumnType::Integer, true),
    ColumnSpec::new("duration", ColumnType::Integer, true),
    ColumnSpec::new("bytes", ColumnType::BigInt, true),
];

const ROLLUPS: &[Rollup] = &[
    Rollup { column: "duration", aggregate: "mean", label: "duration_avg" },
    Rollup { column: "duration", aggregate: "stddev", label: "duration_stddev" },
    Rollup { column: "bytes", aggregate: "max", label: "bytes_max" },
    Rollup { column: "bytes", aggregate: "mean", label: "bytes_avg" },
    Rollup { column: "bytes", aggregate: "stddev", label: "bytes_stddev" },
];

pub const SPEC: CollectionSpec = CollectionSpec {
    module: "amp",
    modsubtype: "http",
    streamtable: "streams_amp_http",
    datatable: "data_amp_http",
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
struct HttpResult {
    #[serde(alias = "url")]
    destination: String,
    max_connections: i64,
    max_connections_per_server: i64,
    max_persistent_connections_per_server: i64,
    #[serde(alias = "pipelining_maxrequests")]
    pipelining_max_requests: i64,
    #[serde(alias = "keep_alive")]
    persist: bool,
    pipelining: bool,
    caching: bool,
    #[serde(default)]
    server_count: Option<i64>,
    #[serde(default)]
    object_count: Option<i64>,
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    bytes: Option<i64>,
}

pub struct AmpHttpParser {
    core: ParserCore,
}

impl AmpHttpParser {
    pub fn new() -> Self {
        AmpHttpParser { core: ParserCore::new(SPEC) }
    }
}

impl Default for AmpHttpParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for AmpHttpParser {
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
            return Err(StoreError::Data("http payload must be a test report".to_string()));
        };

        let mut touched = Vec::new();
        for value in results {
            let result: HttpResult = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Data(format!("malformed http result: {e}")))?;

            let key = stream_key(source, &result);
            let stream_id = match self.core.known_stream(&key) {
                Some(id) => id,
                None => {
                    let name = format!("http {}:{}", source, result.destination);
                    let props = stream_props(source, &result);
                    self.core.stream_for(db, bus, key, name, props, ts).await?
                }
            };

            let mut row = DataRow::new();
            row.insert("server_count".to_string(), result.server_count.into());
            row.insert("object_count".to_string(), result.object_count.into());
            row.insert("duration".to_string(), result.duration.into());
            row.insert("bytes".to_string(), result.bytes.into());

            self.core.insert_data(db, bus, stream_id, ts, row).await?;
            touched.push(stream_id);
        }

        db.update_last_timestamp(&touched, ts).await
    }
}

fn stream_key(source: &str, result: &HttpResult) -> Vec<String> {
    vec![
        source.to_string(),
        result.destination.clone(),
        result.max_connections.to_string(),
        result.max_connections_per_server.to_string(),
        result.max_persistent_connections_per_server.to_string(),
        result.pipelining_max_requests.to_string(),
        result.persist.to_string(),
        result.pipelining.to_string(),
        result.caching.to_string(),
    ]
}

fn stream_props(source: &str, result: &HttpResult) -> DataRow {
    let mut props = DataRow::new();
    props.insert("source".to_string(), source.into());
    props.insert("destination".to_string(), result.destination.as_str().into());
    props.insert("max_connections".to_string(), result.max_connections.into());
    props.insert(
        "max_connections_per_server".to_string(),
        result.max_connections_per_server.into(),
    );
    props.insert(
        "max_persistent_connections_per_server".to_string(),
        result.max_persistent_connections_per_server.into(),
    );
    props.insert(
        "pipelining_max_requests".to_string(),
        result.pipelining_max_requests.into(),
    );
    props.insert("persist".to_string(), result.persist.into());
    props.insert("pipelining".to_string(), result.pipelining.into());
    props.insert("caching".to_string(), result.caching.into());
    props
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_field_spellings_are_accepted() {
        let result: HttpResult = serde_json::from_str(
            r#"{"url": "https://example.org/", "max_connections": 24,
                "max_connections_per_server": 8,
                "max_persistent_connections_per_server": 2,
                "pipelining_maxrequests": 4, "keep_alive": true,
                "pipelining": false, "caching": false,
                "duration": 1450, "bytes": 190000}"#,
        )
        .unwrap();
        assert_eq!(result.destination, "https://example.org/");
        assert_eq!(result.pipelining_max_requests, 4);
        assert!(result.persist);
    }

    #[test]
    fn key_and_props_cover_the_unique_columns() {
        let result: HttpResult = serde_json::from_str(
            r#"{"destination": "https://example.org/", "max_connections": 24,
                "max_connections_per_server": 8,
                "max_persistent_connections_per_server": 2,
                "pipelining_max_requests": 4, "persist": false,
                "pipelining": true, "caching": false}"#,
        )
        .unwrap();
        let key = stream_key("probeA", &result);
        assert_eq!(key.len(), UNIQUE_COLUMNS.len());

        let props = stream_props("probeA", &result);
        for col in UNIQUE_COLUMNS {
            assert!(props.contains_key(*col), "missing {col}");
        }

        // The key built from the props row must match the key built
        // from the result, or startup reloads would duplicate streams.
        let core = ParserCore::new(SPEC);
        assert_eq!(core.key_from_row(&props), key);
    }
}
