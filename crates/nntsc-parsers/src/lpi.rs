//! Passive traffic-classification parsers: per-protocol byte, packet,
//! flow and user counters reported by an LPI monitor.
//!
//! One stream exists per counter, keyed on the monitor, user, direction,
//! reporting frequency and protocol (plus a metric for flows and
//! users). A stream is not created until the first non-zero value
//! arrives, so idle protocols never clutter the stream table.

use async_trait::async_trait;

use nntsc_core::{
    CollectionSpec, ColumnSpec, ColumnType, DataRow, EventSender, IndexSpec, LpiStats, Payload,
    StoreError, TableDefinitions, Timestamp,
};
use nntsc_store::DbInsert;

use crate::base::ParserCore;
use crate::Parser;

const COUNTER_STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("user", ColumnType::Varchar, false),
    ColumnSpec::new("dir", ColumnType::Varchar, false),
    ColumnSpec::new("freq", ColumnType::Integer, false),
    ColumnSpec::new("protocol", ColumnType::Varchar, false),
];

const COUNTER_UNIQUE: &[&str] = &["source", "user", "dir", "freq", "protocol"];

const FLOWS_STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("user", ColumnType::Varchar, false),
    ColumnSpec::new("dir", ColumnType::Varchar, false),
    ColumnSpec::new("freq", ColumnType::Integer, false),
    ColumnSpec::new("protocol", ColumnType::Varchar, false),
    ColumnSpec::new("metric", ColumnType::Varchar, false),
];

const FLOWS_UNIQUE: &[&str] = &["source", "user", "dir", "freq", "protocol", "metric"];

const USERS_STREAM_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("source", ColumnType::Varchar, false),
    ColumnSpec::new("freq", ColumnType::Integer, false),
    ColumnSpec::new("protocol", ColumnType::Varchar, false),
    ColumnSpec::new("metric", ColumnType::Varchar, false),
];

const USERS_UNIQUE: &[&str] = &["source", "freq", "protocol", "metric"];

const LPI_STREAM_INDEXES: &[IndexSpec] = &[
    IndexSpec { columns: &["source"] },
    IndexSpec { columns: &["protocol"] },
];

const BYTES_DATA: &[ColumnSpec] = &[ColumnSpec::new("bytes", ColumnType::BigInt, true)];
const PACKETS_DATA: &[ColumnSpec] = &[ColumnSpec::new("packets", ColumnType::BigInt, true)];
const FLOWS_DATA: &[ColumnSpec] = &[ColumnSpec::new("flows", ColumnType::BigInt, true)];
const USERS_DATA: &[ColumnSpec] = &[ColumnSpec::new("users", ColumnType::BigInt, true)];

pub const BYTES_SPEC: CollectionSpec = CollectionSpec {
    module: "lpi",
    modsubtype: "bytes",
    streamtable: "streams_lpi_bytes",
    datatable: "data_lpi_bytes",
    tables: TableDefinitions {
        stream_columns: COUNTER_STREAM_COLUMNS,
        unique_columns: COUNTER_UNIQUE,
        stream_indexes: LPI_STREAM_INDEXES,
        data_columns: BYTES_DATA,
        data_indexes: &[],
    },
    rollups: &[],
};

pub const PACKETS_SPEC: CollectionSpec = CollectionSpec {
    module: "lpi",
    modsubtype: "packets",
    streamtable: "streams_lpi_packets",
    datatable: "data_lpi_packets",
    tables: TableDefinitions {
        stream_columns: COUNTER_STREAM_COLUMNS,
        unique_columns: COUNTER_UNIQUE,
        stream_indexes: LPI_STREAM_INDEXES,
        data_columns: PACKETS_DATA,
        data_indexes: &[],
    },
    rollups: &[],
};

pub const FLOWS_SPEC: CollectionSpec = CollectionSpec {
    module: "lpi",
    modsubtype: "flows",
    streamtable: "streams_lpi_flows",
    datatable: "data_lpi_flows",
    tables: TableDefinitions {
        stream_columns: FLOWS_STREAM_COLUMNS,
        unique_columns: FLOWS_UNIQUE,
        stream_indexes: LPI_STREAM_INDEXES,
        data_columns: FLOWS_DATA,
        data_indexes: &[],
    },
    rollups: &[],
};

pub const USERS_SPEC: CollectionSpec = CollectionSpec {
    module: "lpi",
    modsubtype: "users",
    streamtable: "streams_lpi_users",
    datatable: "data_lpi_users",
    tables: TableDefinitions {
        stream_columns: USERS_STREAM_COLUMNS,
        unique_columns: USERS_UNIQUE,
        stream_indexes: LPI_STREAM_INDEXES,
        data_columns: USERS_DATA,
        data_indexes: &[],
    },
    rollups: &[],
};

/// Registry name of the parser responsible for an LPI metric.
pub fn family_for_metric(metric: &str) -> Option<&'static str> {
    match metric {
        "bytes" => Some("lpi_bytes"),
        "pkts" | "packets" => Some("lpi_packets"),
        "new_flows" | "curr_flows" | "peak_flows" => Some("lpi_flows"),
        "activeusers" | "observedusers" => Some("lpi_users"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LpiFamily {
    Bytes,
    Packets,
    Flows,
    Users,
}

impl LpiFamily {
    fn value_column(self) -> &'static str {
        match self {
            LpiFamily::Bytes => "bytes",
            LpiFamily::Packets => "packets",
            LpiFamily::Flows => "flows",
            LpiFamily::Users => "users",
        }
    }

    /// Map the report metric onto the stored metric value; `None` for
    /// families without a metric column.
    fn metric_value(self, metric: &str) -> Result<Option<&'static str>, StoreError> {
        let mapped = match (self, metric) {
            (LpiFamily::Bytes, "bytes") => None,
            (LpiFamily::Packets, "pkts" | "packets") => None,
            (LpiFamily::Flows, "new_flows") => Some("new"),
            (LpiFamily::Flows, "curr_flows") => Some("current"),
            (LpiFamily::Flows, "peak_flows") => Some("peak"),
            (LpiFamily::Users, "activeusers") => Some("active"),
            (LpiFamily::Users, "observedusers") => Some("observed"),
            _ => {
                return Err(StoreError::Data(format!(
                    "lpi metric {metric} does not belong to this collection"
                )))
            }
        };
        Ok(mapped)
    }
}

fn direction_label(dir: &str) -> &str {
    match dir {
        "in" => "incoming",
        "out" => "outgoing",
        other => other,
    }
}

pub struct LpiParser {
    core: ParserCore,
    family: LpiFamily,
}

impl LpiParser {
    pub fn bytes() -> Self {
        LpiParser { core: ParserCore::new(BYTES_SPEC), family: LpiFamily::Bytes }
    }

    pub fn packets() -> Self {
        LpiParser { core: ParserCore::new(PACKETS_SPEC), family: LpiFamily::Packets }
    }

    pub fn flows() -> Self {
        LpiParser { core: ParserCore::new(FLOWS_SPEC), family: LpiFamily::Flows }
    }

    pub fn users() -> Self {
        LpiParser { core: ParserCore::new(USERS_SPEC), family: LpiFamily::Users }
    }

    fn stream_key(&self, stats: &LpiStats, proto: &str, metric: Option<&str>) -> Vec<String> {
        match self.family {
            LpiFamily::Bytes | LpiFamily::Packets => vec![
                stats.monitor.clone(),
                stats.user.clone(),
                stats.dir.clone(),
                stats.freq.to_string(),
                proto.to_string(),
            ],
            LpiFamily::Flows => vec![
                stats.monitor.clone(),
                stats.user.clone(),
                stats.dir.clone(),
                stats.freq.to_string(),
                proto.to_string(),
                metric.unwrap_or_default().to_string(),
            ],
            LpiFamily::Users => vec![
                stats.monitor.clone(),
                stats.freq.to_string(),
                proto.to_string(),
                metric.unwrap_or_default().to_string(),
            ],
        }
    }

    fn stream_props(&self, stats: &LpiStats, proto: &str, metric: Option<&str>) -> DataRow {
        let mut props = DataRow::new();
        props.insert("source".to_string(), stats.monitor.as_str().into());
        props.insert("freq".to_string(), stats.freq.into());
        props.insert("protocol".to_string(), proto.into());
        if self.family != LpiFamily::Users {
            props.insert("user".to_string(), stats.user.as_str().into());
            props.insert("dir".to_string(), stats.dir.as_str().into());
        }
        if let Some(metric) = metric {
            props.insert("metric".to_string(), metric.into());
        }
        props
    }

    fn stream_name(&self, stats: &LpiStats, proto: &str, metric: Option<&str>) -> String {
        match self.family {
            LpiFamily::Bytes | LpiFamily::Packets => format!(
                "{} {} {} for user {} -- measured from {} every {} seconds",
                proto,
                direction_label(&stats.dir),
                self.family.value_column(),
                stats.user,
                stats.monitor,
                stats.freq
            ),
            LpiFamily::Flows => format!(
                "{} {} {} flows for user {} -- measured from {} every {} seconds",
                metric.unwrap_or_default(),
                proto,
                direction_label(&stats.dir),
                stats.user,
                stats.monitor,
                stats.freq
            ),
            LpiFamily::Users => {
                let metstr = match metric {
                    Some("active") => "Active",
                    Some("observed") => "Observed",
                    other => other.unwrap_or_default(),
                };
                format!(
                    "{} {} users -- measured from {} every {} seconds",
                    metstr, proto, stats.monitor, stats.freq
                )
            }
        }
    }
}

#[async_trait]
impl Parser for LpiParser {
    fn spec(&self) -> CollectionSpec {
        self.core.spec()
    }

    fn register_existing(&mut self, stream: &DataRow) {
        self.core.register_existing(stream);
    }

    async fn process(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        _ts: Timestamp,
        payload: &Payload,
        _source: &str,
    ) -> Result<(), StoreError> {
        let Payload::Lpi(stats) = payload else {
            return Err(StoreError::Data("lpi payload must be a counter report".to_string()));
        };
        let metric = self.family.metric_value(&stats.metric)?;
        // Counter reports carry their own measurement time.
        let ts = stats.timestamp;

        let mut touched = Vec::new();
        for (proto, value) in &stats.results {
            let key = self.stream_key(stats, proto, metric);
            let stream_id = match self.core.known_stream(&key) {
                Some(id) => id,
                None if *value == 0 => {
                    // Nothing measured yet; creating the stream now
                    // would just record an empty series.
                    continue;
                }
                None => {
                    let name = self.stream_name(stats, proto, metric);
                    let props = self.stream_props(stats, proto, metric);
                    self.core.stream_for(db, bus, key, name, props, ts).await?
                }
            };

            let mut row = DataRow::new();
            row.insert(self.family.value_column().to_string(), (*value).into());
            self.core.insert_data(db, bus, stream_id, ts, row).await?;
            touched.push(stream_id);
        }

        db.update_last_timestamp(&touched, ts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(metric: &str) -> LpiStats {
        LpiStats {
            monitor: "waikato".into(),
            user: "all".into(),
            dir: "out".into(),
            freq: 300,
            metric: metric.into(),
            timestamp: 1000,
            results: vec![("http".into(), 512)],
        }
    }

    #[test]
    fn metric_mapping_per_family() {
        assert_eq!(LpiFamily::Bytes.metric_value("bytes").unwrap(), None);
        assert_eq!(LpiFamily::Packets.metric_value("pkts").unwrap(), None);
        assert_eq!(LpiFamily::Flows.metric_value("peak_flows").unwrap(), Some("peak"));
        assert_eq!(LpiFamily::Users.metric_value("activeusers").unwrap(), Some("active"));
        assert!(LpiFamily::Bytes.metric_value("pkts").is_err());
        assert!(LpiFamily::Users.metric_value("bytes").is_err());
    }

    #[test]
    fn names_read_like_descriptions() {
        let parser = LpiParser::packets();
        assert_eq!(
            parser.stream_name(&stats("pkts"), "http", None),
            "http outgoing packets for user all -- measured from waikato every 300 seconds"
        );

        let parser = LpiParser::users();
        assert_eq!(
            parser.stream_name(&stats("activeusers"), "http", Some("active")),
            "Active http users -- measured from waikato every 300 seconds"
        );
        assert_eq!(
            parser.stream_name(&stats("observedusers"), "dns", Some("observed")),
            "Observed dns users -- measured from waikato every 300 seconds"
        );
    }

    #[test]
    fn keys_round_trip_through_stream_rows() {
        for (parser, metric_name, metric) in [
            (LpiParser::bytes(), "bytes", None),
            (LpiParser::flows(), "new_flows", Some("new")),
            (LpiParser::users(), "observedusers", Some("observed")),
        ] {
            let s = stats(metric_name);
            let key = parser.stream_key(&s, "dns", metric);
            let props = parser.stream_props(&s, "dns", metric);
            assert_eq!(parser.core.key_from_row(&props), key, "{metric_name}");
        }
    }

    #[test]
    fn users_streams_ignore_user_and_direction() {
        let parser = LpiParser::users();
        let key = parser.stream_key(&stats("activeusers"), "http", Some("active"));
        assert_eq!(key, vec!["waikato", "300", "http", "active"]);
    }
}
