//! Data model shared by the parsers, the store gateway and the query
//! server.

use std::collections::BTreeMap;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// Measurement timestamps are whole epoch seconds.
pub type Timestamp = i64;

/// The tuple of stringified parameter values that uniquely identifies a
/// stream within its collection.
pub type StreamKey = Vec<String>;

/// A row of named values, used for stream attributes, measurement rows
/// and query results alike.
pub type DataRow = BTreeMap<String, FieldValue>;

/// A single value inside a [`DataRow`].
///
/// The variant order matters for deserialization: `serde` tries the
/// variants top to bottom, so null must come before the scalars and the
/// integer forms before the float forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    IntegerArray(Vec<Option<i64>>),
    FloatArray(Vec<Option<f64>>),
    TextArray(Vec<String>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// The value as an integer, when it holds one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Stringified form used when building stream keys. Matches the
    /// text rendering the store produces for the same value.
    pub fn key_str(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Integer(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Text(v) => v.clone(),
            FieldValue::IntegerArray(_) | FieldValue::FloatArray(_) | FieldValue::TextArray(_) => {
                String::new()
            }
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => FieldValue::Null,
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            FieldValue::Null => Ok(IsNull::Yes),
            FieldValue::Bool(v) => v.to_sql(ty, out),
            FieldValue::Integer(v) => {
                if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    v.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*v as f64).to_sql(ty, out)
                } else if *ty == Type::VARCHAR || *ty == Type::TEXT {
                    v.to_string().to_sql(ty, out)
                } else {
                    Err(format!("cannot bind integer value to column of type {ty}").into())
                }
            }
            FieldValue::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    v.to_sql(ty, out)
                } else {
                    Err(format!("cannot bind float value to column of type {ty}").into())
                }
            }
            FieldValue::Text(v) => {
                if *ty == Type::VARCHAR || *ty == Type::TEXT {
                    v.to_sql(ty, out)
                } else if *ty == Type::INET {
                    v.parse::<std::net::IpAddr>()?.to_sql(ty, out)
                } else {
                    Err(format!("cannot bind text value to column of type {ty}").into())
                }
            }
            FieldValue::IntegerArray(v) => {
                if *ty == Type::INT2_ARRAY {
                    let narrowed: Result<Vec<Option<i16>>, _> =
                        v.iter().map(|e| e.map(i16::try_from).transpose()).collect();
                    narrowed?.to_sql(ty, out)
                } else if *ty == Type::INT4_ARRAY {
                    let narrowed: Result<Vec<Option<i32>>, _> =
                        v.iter().map(|e| e.map(i32::try_from).transpose()).collect();
                    narrowed?.to_sql(ty, out)
                } else if *ty == Type::INT8_ARRAY {
                    v.to_sql(ty, out)
                } else if *ty == Type::FLOAT8_ARRAY {
                    let widened: Vec<Option<f64>> = v.iter().map(|e| e.map(|i| i as f64)).collect();
                    widened.to_sql(ty, out)
                } else {
                    Err(format!("cannot bind integer array to column of type {ty}").into())
                }
            }
            FieldValue::FloatArray(v) => {
                if *ty == Type::FLOAT8_ARRAY {
                    v.to_sql(ty, out)
                } else if *ty == Type::FLOAT4_ARRAY {
                    let narrowed: Vec<Option<f32>> = v.iter().map(|e| e.map(|f| f as f32)).collect();
                    narrowed.to_sql(ty, out)
                } else {
                    Err(format!("cannot bind float array to column of type {ty}").into())
                }
            }
            FieldValue::TextArray(v) => {
                if *ty == Type::TEXT_ARRAY || *ty == Type::VARCHAR_ARRAY {
                    v.to_sql(ty, out)
                } else if *ty == Type::INET_ARRAY {
                    let addresses: Result<Vec<std::net::IpAddr>, _> =
                        v.iter().map(|a| a.parse()).collect();
                    addresses?.to_sql(ty, out)
                } else {
                    Err(format!("cannot bind text array to column of type {ty}").into())
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Per-variant compatibility is checked inside to_sql.
        true
    }

    to_sql_checked!();
}

/// A measurement family registered in the `collections` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: i32,
    pub module: String,
    pub modsubtype: String,
    pub streamtable: String,
    pub datatable: String,
}

impl Collection {
    /// The short name used for export topics and client-facing
    /// messages, e.g. `amp_icmp`.
    pub fn name(&self) -> String {
        format!("{}_{}", self.module, self.modsubtype)
    }
}

/// SQL column types parsers may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Double,
    Varchar,
    Bool,
    Inet,
    IntegerArray,
    DoubleArray,
    InetArray,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::SmallInt => "SMALLINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Bool => "BOOLEAN",
            ColumnType::Inet => "INET",
            ColumnType::IntegerArray => "INTEGER[]",
            ColumnType::DoubleArray => "DOUBLE PRECISION[]",
            ColumnType::InetArray => "INET[]",
        }
    }

    /// The cast applied when a bound text parameter needs to become
    /// this type server-side.
    pub fn bind_cast(self) -> Option<&'static str> {
        match self {
            ColumnType::Inet => Some("inet"),
            ColumnType::InetArray => Some("inet[]"),
            _ => None,
        }
    }
}

/// One column of a stream or data table.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnType,
    pub nullable: bool,
    pub default: Option<&'static str>,
}

impl ColumnSpec {
    pub const fn new(name: &'static str, kind: ColumnType, nullable: bool) -> Self {
        ColumnSpec { name, kind, nullable, default: None }
    }

    pub const fn with_default(
        name: &'static str,
        kind: ColumnType,
        nullable: bool,
        default: &'static str,
    ) -> Self {
        ColumnSpec { name, kind, nullable, default: Some(default) }
    }
}

/// A secondary index over a table.
#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub columns: &'static [&'static str],
}

/// Everything the store gateway needs to build one collection's
/// tables.
#[derive(Debug, Clone, Copy)]
pub struct TableDefinitions {
    pub stream_columns: &'static [ColumnSpec],
    pub unique_columns: &'static [&'static str],
    pub stream_indexes: &'static [IndexSpec],
    pub data_columns: &'static [ColumnSpec],
    pub data_indexes: &'static [IndexSpec],
}

/// A rollup a parser wants materialized when continuous queries are
/// registered: aggregate a data column under a stable label.
#[derive(Debug, Clone, Copy)]
pub struct Rollup {
    pub column: &'static str,
    pub aggregate: &'static str,
    pub label: &'static str,
}

/// A parser's full declaration of the collection it feeds: identity,
/// table names, table shapes and optional rollups.
#[derive(Debug, Clone, Copy)]
pub struct CollectionSpec {
    pub module: &'static str,
    pub modsubtype: &'static str,
    pub streamtable: &'static str,
    pub datatable: &'static str,
    pub tables: TableDefinitions,
    pub rollups: &'static [Rollup],
}

impl CollectionSpec {
    /// Short collection name, e.g. `amp_icmp`.
    pub fn name(&self) -> String {
        format!("{}_{}", self.module, self.modsubtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_json_shapes() {
        let cases = vec![
            (FieldValue::Null, "null"),
            (FieldValue::Bool(true), "true"),
            (FieldValue::Integer(42), "42"),
            (FieldValue::Float(1.5), "1.5"),
            (FieldValue::Text("probe".into()), "\"probe\""),
            (
                FieldValue::IntegerArray(vec![Some(120), None]),
                "[120,null]",
            ),
        ];
        for (value, expected) in cases {
            let json = serde_json::to_string(&value).unwrap();
            assert_eq!(json, expected);
            let back: FieldValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn float_array_survives_integer_entries() {
        // A float array whose first entries happen to be whole numbers
        // must not collapse to an integer array on the way back in.
        let json = "[120.5,130.0,null]";
        let back: FieldValue = serde_json::from_str(json).unwrap();
        assert_eq!(
            back,
            FieldValue::FloatArray(vec![Some(120.5), Some(130.0), None])
        );
    }

    #[test]
    fn option_conversion() {
        assert_eq!(FieldValue::from(None::<i64>), FieldValue::Null);
        assert_eq!(FieldValue::from(Some(7i64)), FieldValue::Integer(7));
    }

    #[test]
    fn collection_name() {
        let col = Collection {
            id: 1,
            module: "amp".into(),
            modsubtype: "icmp".into(),
            streamtable: "streams_amp_icmp".into(),
            datatable: "data_amp_icmp".into(),
        };
        assert_eq!(col.name(), "amp_icmp");
    }
}
