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

pub mod discovery;
pub mod replication;
pub mod scan;
pub mod watermark;

use std::str::FromStr;

use async_trait::async_trait;
use thiserror_ext::AsReport;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, Config, NoTls};

use crate::config::CaptureConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::source::{CaptureSource, ScannedRow};
use crate::state::StreamId;

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_uri(uri: &str) -> ConnectorResult<Config> {
    Config::from_str(uri)
        .map_err(|e| ConnectorError::Config(format!("bad connection_uri: {e}")))
}

async fn spawn_connection(config: &Config) -> ConnectorResult<Client> {
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e.as_report(), "postgres connection failed");
        }
    });
    Ok(client)
}

/// Opens the ordinary client connection used for scans, discovery and
/// watermark writes.
pub async fn connect(config: &CaptureConfig) -> ConnectorResult<Client> {
    spawn_connection(&parse_uri(&config.connection_uri)?).await
}

/// Opens the dedicated replication-mode connection.
pub async fn connect_replication(config: &CaptureConfig) -> ConnectorResult<Client> {
    let mut pg_config = parse_uri(&config.connection_uri)?;
    pg_config.replication_mode(ReplicationMode::Logical);
    spawn_connection(&pg_config).await
}

/// The position the slot would replay from today; the starting point of a
/// fresh capture.
pub async fn slot_confirmed_lsn(client: &Client, slot_name: &str) -> ConnectorResult<PgLsn> {
    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text FROM pg_catalog.pg_replication_slots \
             WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?
        .ok_or_else(|| {
            ConnectorError::Config(format!("replication slot {slot_name:?} does not exist"))
        })?;
    let lsn: String = row.try_get(0)?;
    PgLsn::from_str(&lsn)
        .map_err(|_| ConnectorError::Decode(format!("bad confirmed_flush_lsn {lsn:?}")))
}

pub async fn publication_exists(client: &Client, publication: &str) -> ConnectorResult<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_publication WHERE pubname = $1)",
            &[&publication],
        )
        .await?;
    Ok(row.try_get(0)?)
}

/// The scan-side database handle driven by the interleaver.
pub struct PostgresSource {
    client: Client,
    slot_name: String,
    watermarks_schema: String,
    watermarks_table: String,
}

impl PostgresSource {
    pub async fn new(config: &CaptureConfig) -> ConnectorResult<Self> {
        let client = connect(config).await?;
        let (watermarks_schema, watermarks_table) = config.watermarks_ref()?;
        Ok(Self {
            client,
            slot_name: config.slot_name.clone(),
            watermarks_schema,
            watermarks_table,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn ensure_watermarks_table(&self) -> ConnectorResult<()> {
        watermark::ensure_table(&self.client, &self.watermarks_schema, &self.watermarks_table)
            .await
    }
}

#[async_trait]
impl CaptureSource for PostgresSource {
    async fn write_watermark(&mut self) -> ConnectorResult<String> {
        watermark::write(
            &self.client,
            &self.watermarks_schema,
            &self.watermarks_table,
            &self.slot_name,
        )
        .await
    }

    async fn scan_chunk(
        &mut self,
        stream: &StreamId,
        scan_key: &[String],
        resume: Option<&[u8]>,
        limit: usize,
    ) -> ConnectorResult<Vec<ScannedRow>> {
        scan::scan_chunk(&self.client, stream, scan_key, resume, limit).await
    }
}
