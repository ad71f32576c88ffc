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

//! Watermark fencing. The upsert happens inside the source database, so the
//! same change comes back on the replication stream; observing it there is
//! how the interleaver knows all prior log activity has been drained.

use tokio_postgres::Client;
use uuid::Uuid;

use crate::error::ConnectorResult;
use crate::source::postgres::quote_ident;

/// Creates the two-column watermarks table if it does not exist. The
/// publication must include this table; that is a deployment requirement.
pub async fn ensure_table(client: &Client, schema: &str, table: &str) -> ConnectorResult<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (slot TEXT PRIMARY KEY, watermark TEXT)",
        quote_ident(schema),
        quote_ident(table),
    );
    client.execute(&sql, &[]).await?;
    Ok(())
}

/// Upserts a fresh UUID for `slot` and returns it.
pub async fn write(
    client: &Client,
    schema: &str,
    table: &str,
    slot: &str,
) -> ConnectorResult<String> {
    let watermark = Uuid::new_v4().to_string();
    let sql = format!(
        "INSERT INTO {}.{} (slot, watermark) VALUES ($1, $2) \
         ON CONFLICT (slot) DO UPDATE SET watermark = EXCLUDED.watermark",
        quote_ident(schema),
        quote_ident(table),
    );
    client.execute(&sql, &[&slot, &watermark]).await?;
    tracing::debug!(slot, watermark = %watermark, "wrote watermark");
    Ok(watermark)
}
