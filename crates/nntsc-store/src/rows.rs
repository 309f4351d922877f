//! Conversion from driver rows to the shared [`DataRow`] shape.

use std::net::IpAddr;

use tokio_postgres::types::Type;
use tokio_postgres::Row;

use nntsc_core::{DataRow, FieldValue, StoreError};

/// Convert a result row into a name→value map. The surrogate `id`
/// column from the common `streams` table is skipped; everything else
/// keeps its column name.
pub fn row_to_datarow(row: &Row) -> Result<DataRow, StoreError> {
    let mut out = DataRow::new();

    for (idx, col) in row.columns().iter().enumerate() {
        let name = col.name();
        if name == "id" {
            continue;
        }
        out.insert(name.to_string(), column_value(row, idx, col.type_())?);
    }

    Ok(out)
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Result<FieldValue, StoreError> {
    let value = if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| FieldValue::Integer(v as i64))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| FieldValue::Integer(v as i64))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(FieldValue::Integer)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map(|v| FieldValue::Float(v as f64))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(FieldValue::Float)
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(FieldValue::Bool)
    } else if *ty == Type::VARCHAR || *ty == Type::TEXT || *ty == Type::NAME {
        row.try_get::<_, Option<String>>(idx)?.map(FieldValue::Text)
    } else if *ty == Type::INET {
        row.try_get::<_, Option<IpAddr>>(idx)?
            .map(|v| FieldValue::Text(v.to_string()))
    } else if *ty == Type::INT2_ARRAY {
        row.try_get::<_, Option<Vec<Option<i16>>>>(idx)?
            .map(|v| FieldValue::IntegerArray(v.into_iter().map(|e| e.map(|i| i as i64)).collect()))
    } else if *ty == Type::INT4_ARRAY {
        row.try_get::<_, Option<Vec<Option<i32>>>>(idx)?
            .map(|v| FieldValue::IntegerArray(v.into_iter().map(|e| e.map(|i| i as i64)).collect()))
    } else if *ty == Type::INT8_ARRAY {
        row.try_get::<_, Option<Vec<Option<i64>>>>(idx)?
            .map(FieldValue::IntegerArray)
    } else if *ty == Type::FLOAT8_ARRAY {
        row.try_get::<_, Option<Vec<Option<f64>>>>(idx)?
            .map(FieldValue::FloatArray)
    } else if *ty == Type::TEXT_ARRAY || *ty == Type::VARCHAR_ARRAY {
        row.try_get::<_, Option<Vec<String>>>(idx)?
            .map(FieldValue::TextArray)
    } else if *ty == Type::INET_ARRAY {
        row.try_get::<_, Option<Vec<IpAddr>>>(idx)?
            .map(|v| FieldValue::TextArray(v.into_iter().map(|a| a.to_string()).collect()))
    } else {
        return Err(StoreError::Coding(format!(
            "unhandled column type {ty} for column {}",
            row.columns()[idx].name()
        )));
    };

    Ok(value.unwrap_or(FieldValue::Null))
}
