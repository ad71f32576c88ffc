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

//! Catalog discovery against `pg_catalog`.

use std::collections::BTreeMap;

use tokio_postgres::Client;

use crate::catalog::{Catalog, DiscoveredStream};
use crate::error::ConnectorResult;
use crate::state::{stream_id, StreamId};

const LIST_TABLES: &str = "\
    SELECT n.nspname, c.relname \
    FROM pg_catalog.pg_class c \
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
    WHERE c.relkind = 'r' \
      AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
      AND n.nspname NOT LIKE 'pg_toast%' \
      AND n.nspname NOT LIKE 'pg_temp%' \
    ORDER BY n.nspname, c.relname";

// Key columns in key order, following pg_constraint's conkey array.
const LIST_PRIMARY_KEYS: &str = "\
    SELECT n.nspname, c.relname, a.attname, \
           array_position(con.conkey, a.attnum) AS key_position \
    FROM pg_catalog.pg_constraint con \
    JOIN pg_catalog.pg_class c ON c.oid = con.conrelid \
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
    JOIN pg_catalog.pg_attribute a \
      ON a.attrelid = c.oid AND a.attnum = ANY (con.conkey) \
    WHERE con.contype = 'p' \
    ORDER BY n.nspname, c.relname, key_position";

/// Primary-key columns of every table that has one, keyed by stream id.
pub async fn primary_keys(client: &Client) -> ConnectorResult<BTreeMap<StreamId, Vec<String>>> {
    let mut keys: BTreeMap<StreamId, Vec<String>> = BTreeMap::new();
    for row in client.query(LIST_PRIMARY_KEYS, &[]).await? {
        let namespace: String = row.try_get(0)?;
        let name: String = row.try_get(1)?;
        let column: String = row.try_get(2)?;
        keys.entry(stream_id(&namespace, &name))
            .or_default()
            .push(column);
    }
    Ok(keys)
}

/// Lists candidate streams: every ordinary user table, carrying its
/// primary key when it has one. The watermarks table is not a candidate.
pub async fn discover(
    client: &Client,
    watermarks_stream: &StreamId,
) -> ConnectorResult<Catalog> {
    let keys = primary_keys(client).await?;
    let mut streams = Vec::new();
    for row in client.query(LIST_TABLES, &[]).await? {
        let namespace: String = row.try_get(0)?;
        let name: String = row.try_get(1)?;
        let id = stream_id(&namespace, &name);
        if &id == watermarks_stream {
            continue;
        }
        streams.push(DiscoveredStream {
            namespace,
            name,
            primary_key: keys.get(&id).cloned().unwrap_or_default(),
            supported_sync_modes: vec!["incremental".to_owned()],
            source_defined_cursor: true,
        });
    }
    Ok(Catalog { streams })
}
