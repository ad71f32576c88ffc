// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Translation of driver values into wire-serializable scalars.
//!
//! Both sides of the capture meet here: backfill rows arrive in the binary
//! wire format and are translated per column [`Type`]; replication tuples
//! arrive in pgoutput's text format and are translated per type OID. The two
//! paths produce identical JSON for the same committed value, which is what
//! lets the interleaver patch one into the other.

mod scalar_adapter;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value};
use tokio_postgres::types::Type;
use tokio_postgres::Row;

pub use self::scalar_adapter::{PgInet, PgMacAddr, PgNumeric};
use crate::error::{ConnectorError, ConnectorResult};
use crate::tuple::{self, KeyValue};

/// Translates a full scan row. Unknown column types are fatal, never
/// silently dropped: the downstream encoder must not receive values it
/// cannot represent.
pub fn translate_row(table: &str, row: &Row) -> ConnectorResult<Map<String, Value>> {
    let mut fields = Map::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = translate_cell(row, i, column.type_()).map_err(|reason| {
            ConnectorError::Translate {
                table: table.to_owned(),
                column: column.name().to_owned(),
                reason,
            }
        })?;
        fields.insert(column.name().to_owned(), value);
    }
    Ok(fields)
}

macro_rules! get_cell {
    ($row:expr, $i:expr, $type:ty, $to:expr) => {
        $row.try_get::<_, Option<$type>>($i)
            .map_err(|e| e.to_string())?
            .map_or(Value::Null, $to)
    };
}

fn translate_cell(row: &Row, i: usize, ty: &Type) -> Result<Value, String> {
    // `Type` constants are not usable as patterns, so dispatch on the name
    let value = match ty.name() {
        "bool" => get_cell!(row, i, bool, Value::Bool),
        "int2" => get_cell!(row, i, i16, |v| Value::from(v as i64)),
        "int4" => get_cell!(row, i, i32, |v| Value::from(v as i64)),
        "int8" => get_cell!(row, i, i64, Value::from),
        "oid" => get_cell!(row, i, u32, |v| Value::from(v as i64)),
        "float4" => get_cell!(row, i, f32, |v| float_value(v as f64)),
        "float8" => get_cell!(row, i, f64, float_value),
        "text" | "varchar" | "bpchar" | "name" => {
            get_cell!(row, i, String, Value::String)
        }
        "bytea" => get_cell!(row, i, Vec<u8>, |v| Value::String(format!(
            "\\x{}",
            hex::encode(v)
        ))),
        "uuid" => get_cell!(row, i, uuid::Uuid, |v| Value::String(
            v.hyphenated().to_string()
        )),
        "date" => get_cell!(row, i, NaiveDate, |v| Value::String(
            v.format("%Y-%m-%d").to_string()
        )),
        "time" => get_cell!(row, i, NaiveTime, |v| Value::String(
            v.format("%H:%M:%S%.6f").to_string()
        )),
        "timestamp" => {
            get_cell!(row, i, NaiveDateTime, |v| Value::String(format_timestamp(v)))
        }
        "timestamptz" => {
            get_cell!(row, i, DateTime<Utc>, |v| Value::String(format_timestamptz(v)))
        }
        "json" | "jsonb" => get_cell!(row, i, Value, |v| v),
        "numeric" => get_cell!(row, i, PgNumeric, |v| Value::String(v.0)),
        "inet" | "cidr" => get_cell!(row, i, PgInet, |v| Value::String(v.0)),
        "macaddr" => get_cell!(row, i, PgMacAddr, |v| Value::String(v.0)),
        other => return Err(format!("unsupported column type {other}")),
    };
    Ok(value)
}

/// Translates one pgoutput text value by its type OID. Types without a
/// structured mapping keep pgoutput's text form, which is already the
/// canonical server rendering.
pub fn translate_text(type_oid: u32, text: &str) -> Value {
    let Some(ty) = Type::from_oid(type_oid) else {
        return Value::String(text.to_owned());
    };
    match ty.name() {
        "bool" => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            other => Value::String(other.to_owned()),
        },
        "int2" | "int4" | "int8" | "oid" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_owned())),
        "float4" | "float8" => text
            .parse::<f64>()
            .map(float_value)
            .unwrap_or_else(|_| Value::String(text.to_owned())),
        "json" | "jsonb" => serde_json::from_str(text)
            .unwrap_or_else(|_| Value::String(text.to_owned())),
        "timestamp" => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map(|v| Value::String(format_timestamp(v)))
            .unwrap_or_else(|_| Value::String(text.to_owned())),
        "timestamptz" => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(|v| Value::String(format_timestamptz(v.with_timezone(&Utc))))
            .unwrap_or_else(|_| Value::String(text.to_owned())),
        _ => Value::String(text.to_owned()),
    }
}

fn float_value(v: f64) -> Value {
    // non-finite floats have no JSON number form; keep the server spelling
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| {
            Value::String(if v.is_nan() {
                "NaN".to_owned()
            } else if v > 0.0 {
                "Infinity".to_owned()
            } else {
                "-Infinity".to_owned()
            })
        })
}

fn format_timestamp(v: NaiveDateTime) -> String {
    v.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn format_timestamptz(v: DateTime<Utc>) -> String {
    v.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Extracts the scan-key tuple from translated fields and encodes it.
pub fn row_key(
    stream: &str,
    fields: &Map<String, Value>,
    scan_key: &[String],
) -> ConnectorResult<Vec<u8>> {
    let mut values = Vec::with_capacity(scan_key.len());
    for column in scan_key {
        let value = fields.get(column).ok_or_else(|| ConnectorError::Decode(
            format!("event on {stream} is missing key column {column:?}"),
        ))?;
        values.push(key_value(stream, column, value)?);
    }
    Ok(tuple::encode(&values))
}

fn key_value(stream: &str, column: &str, value: &Value) -> ConnectorResult<KeyValue> {
    match value {
        Value::Null => Ok(KeyValue::Null),
        Value::Bool(v) => Ok(KeyValue::Bool(*v)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(KeyValue::Int(v))
            } else if let Some(v) = n.as_f64() {
                Ok(KeyValue::Float(v))
            } else {
                Err(ConnectorError::Decode(format!(
                    "key column {column:?} of {stream} holds an unorderable number {n}"
                )))
            }
        }
        Value::String(v) => Ok(KeyValue::Text(v.clone())),
        other => Err(ConnectorError::Decode(format!(
            "key column {column:?} of {stream} holds a non-scalar value {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_scalars() {
        assert_eq!(translate_text(Type::BOOL.oid(), "t"), Value::Bool(true));
        assert_eq!(translate_text(Type::INT8.oid(), "42"), Value::from(42));
        assert_eq!(translate_text(Type::FLOAT8.oid(), "1.5"), Value::from(1.5));
        assert_eq!(
            translate_text(Type::FLOAT8.oid(), "NaN"),
            Value::String("NaN".to_owned())
        );
        assert_eq!(
            translate_text(Type::TEXT.oid(), "hello"),
            Value::String("hello".to_owned())
        );
        assert_eq!(
            translate_text(Type::NUMERIC.oid(), "144659.20"),
            Value::String("144659.20".to_owned())
        );
    }

    #[test]
    fn test_text_json_passthrough() {
        assert_eq!(
            translate_text(Type::JSONB.oid(), r#"{"a": [1, 2]}"#),
            serde_json::json!({"a": [1, 2]})
        );
    }

    #[test]
    fn test_text_timestamps_match_scan_format() {
        assert_eq!(
            translate_text(Type::TIMESTAMP.oid(), "1994-07-30 12:00:01.5"),
            Value::String("1994-07-30T12:00:01.500000".to_owned())
        );
        assert_eq!(
            translate_text(Type::TIMESTAMPTZ.oid(), "1994-07-30 12:00:01.5+02"),
            Value::String("1994-07-30T10:00:01.500000+00:00".to_owned())
        );
    }

    #[test]
    fn test_unknown_oid_passes_text_through() {
        assert_eq!(
            translate_text(600, "(1.0,2.0)"), // point
            Value::String("(1.0,2.0)".to_owned())
        );
    }

    #[test]
    fn test_row_key_ordering_across_translation() {
        let key = vec!["id".to_owned()];
        let mut low = Map::new();
        low.insert("id".to_owned(), Value::from(2));
        let mut high = Map::new();
        high.insert("id".to_owned(), Value::from(10));
        let low_key = row_key("public.orders", &low, &key).unwrap();
        let high_key = row_key("public.orders", &high, &key).unwrap();
        assert!(low_key < high_key);
    }

    #[test]
    fn test_row_key_missing_column() {
        let fields = Map::new();
        let err = row_key("public.orders", &fields, &["id".to_owned()]).unwrap_err();
        assert!(matches!(err, ConnectorError::Decode(_)));
    }

    #[test]
    fn test_composite_row_key_lexicographic() {
        let key = vec!["region".to_owned(), "id".to_owned()];
        let mut a = Map::new();
        a.insert("region".to_owned(), Value::String("eu".to_owned()));
        a.insert("id".to_owned(), Value::from(99));
        let mut b = Map::new();
        b.insert("region".to_owned(), Value::String("us".to_owned()));
        b.insert("id".to_owned(), Value::from(1));
        assert!(
            row_key("s", &a, &key).unwrap() < row_key("s", &b, &key).unwrap(),
            "first component dominates"
        );
    }
}
