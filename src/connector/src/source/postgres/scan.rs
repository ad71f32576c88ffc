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

//! Keyed chunk scans. Row-constructor comparison advances composite keys
//! lexicographically, matching the order of the encoded key tuples.

use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Client;

use crate::error::{ConnectorError, ConnectorResult};
use crate::parser;
use crate::source::postgres::quote_ident;
use crate::source::ScannedRow;
use crate::state::{split_stream_id, StreamId};
use crate::tuple::{self, KeyValue};

/// Fetches the next chunk of `stream`: up to `limit` rows whose scan key is
/// strictly greater than `resume`, ascending. A result shorter than `limit`
/// means the table is exhausted.
pub async fn scan_chunk(
    client: &Client,
    stream: &StreamId,
    scan_key: &[String],
    resume: Option<&[u8]>,
    limit: usize,
) -> ConnectorResult<Vec<ScannedRow>> {
    let (namespace, table) = split_stream_id(stream)?;
    let order_by = scan_key.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();

    let resume_values = resume
        .map(|bytes| {
            tuple::decode(bytes).map_err(|e| {
                ConnectorError::Decode(format!("corrupt resume key for {stream}: {e}"))
            })
        })
        .transpose()?;

    let sql = match &resume_values {
        None => format!(
            "SELECT * FROM {}.{} ORDER BY {} LIMIT {}",
            quote_ident(namespace),
            quote_ident(table),
            order_by.join(", "),
            limit,
        ),
        Some(values) => {
            if values.len() != scan_key.len() {
                return Err(ConnectorError::Decode(format!(
                    "resume key arity {} does not match scan key {:?} of {stream}",
                    values.len(),
                    scan_key,
                )));
            }
            let placeholders = values
                .iter()
                .enumerate()
                .map(|(i, v)| format!("${}::{}", i + 1, sql_type(v)))
                .collect::<Vec<_>>();
            format!(
                "SELECT * FROM {}.{} WHERE ({}) > ({}) ORDER BY {} LIMIT {}",
                quote_ident(namespace),
                quote_ident(table),
                order_by.join(", "),
                placeholders.join(", "),
                order_by.join(", "),
                limit,
            )
        }
    };

    let params: Vec<SqlKey<'_>> = resume_values
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(SqlKey)
        .collect();
    let param_refs: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    let rows = client.query(&sql, &param_refs).await?;

    let mut chunk = Vec::with_capacity(rows.len());
    for row in &rows {
        let fields = parser::translate_row(stream, row)?;
        let key = parser::row_key(stream, &fields, scan_key)?;
        chunk.push(ScannedRow { key, fields });
    }
    // the database ordered by column value; key encoding is the tie-breaking
    // authority for everything downstream
    chunk.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(chunk)
}

fn sql_type(value: &KeyValue) -> &'static str {
    match value {
        KeyValue::Null => "text",
        KeyValue::Bool(_) => "bool",
        KeyValue::Int(_) => "int8",
        KeyValue::Float(_) => "float8",
        KeyValue::Bytes(_) => "bytea",
        KeyValue::Text(_) => "text",
    }
}

/// Binds a decoded key component as a query parameter. The explicit casts in
/// the query text pick the parameter types, so `accepts` is permissive.
#[derive(Debug)]
struct SqlKey<'a>(&'a KeyValue);

impl ToSql for SqlKey<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self.0 {
            KeyValue::Null => Ok(IsNull::Yes),
            KeyValue::Bool(v) => v.to_sql(ty, out),
            KeyValue::Int(v) => v.to_sql(ty, out),
            KeyValue::Float(v) => v.to_sql(ty, out),
            KeyValue::Bytes(v) => v.as_slice().to_sql(ty, out),
            KeyValue::Text(v) => v.as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_per_variant() {
        assert_eq!(sql_type(&KeyValue::Int(1)), "int8");
        assert_eq!(sql_type(&KeyValue::Text("x".into())), "text");
        assert_eq!(sql_type(&KeyValue::Float(0.5)), "float8");
    }
}
