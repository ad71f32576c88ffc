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

//! Subcommand handlers. The outer CLI provides argument framing; the
//! handlers own connectivity, reconciliation and the capture itself.

use serde::{Deserialize, Serialize};
use thiserror_ext::AsReport;
use tokio::sync::{mpsc, watch};
use tokio_postgres::types::PgLsn;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureOptions, Interleaver};
use crate::catalog::{Catalog, ConfiguredCatalog};
use crate::config::CaptureConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::message::Emitter;
use crate::source::postgres::{
    self, discovery, replication::ReplicationReader, PostgresSource,
};
use crate::state::CaptureState;

/// Capacity of the replication event channel between the reader task and
/// the interleaver.
const EVENT_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Verifies connectivity, the replication slot, and the publication.
/// Failures are reported in-band, not as process errors.
pub async fn check(config: &CaptureConfig) -> CheckResult {
    match check_inner(config).await {
        Ok(()) => CheckResult {
            status: CheckStatus::Succeeded,
            message: None,
        },
        Err(e) => CheckResult {
            status: CheckStatus::Failed,
            message: Some(e.to_report_string()),
        },
    }
}

async fn check_inner(config: &CaptureConfig) -> ConnectorResult<()> {
    config.validate()?;
    let client = postgres::connect(config).await?;
    client.query_one("SELECT 1", &[]).await?;
    postgres::slot_confirmed_lsn(&client, &config.slot_name).await?;
    if !postgres::publication_exists(&client, &config.publication_name).await? {
        return Err(ConnectorError::Config(format!(
            "publication {:?} does not exist",
            config.publication_name
        )));
    }
    Ok(())
}

/// Lists candidate streams with their source-defined keys.
pub async fn discover(config: &CaptureConfig) -> ConnectorResult<Catalog> {
    config.validate()?;
    let client = postgres::connect(config).await?;
    discovery::discover(&client, &config.watermarks_stream_id()?).await
}

/// Runs the capture until cancellation, a deadline, the poll-timeout
/// watchdog, or a fatal error.
pub async fn read<E: Emitter + 'static>(
    config: &CaptureConfig,
    catalog: &ConfiguredCatalog,
    state_blob: Option<&str>,
    emitter: E,
    cancel: CancellationToken,
) -> ConnectorResult<()> {
    config.validate()?;
    let mut state = CaptureState::restore(state_blob)?;

    let source = PostgresSource::new(config).await?;
    let discovered_keys = discovery::primary_keys(source.client()).await?;
    let watermarks_stream = config.watermarks_stream_id()?;
    state.reconcile(catalog, &discovered_keys, &watermarks_stream)?;
    source.ensure_watermarks_table().await?;

    // a fresh capture replays from wherever the slot already stands
    if state.lsn()? == PgLsn::from(0) {
        let slot_lsn = postgres::slot_confirmed_lsn(source.client(), &config.slot_name).await?;
        state.advance_lsn(slot_lsn)?;
    }
    let start_lsn = state.lsn()?;

    let replication_client = postgres::connect_replication(config).await?;
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (confirmed_tx, confirmed_rx) = watch::channel(start_lsn);

    let reader = ReplicationReader {
        slot_name: config.slot_name.clone(),
        publication_name: config.publication_name.clone(),
        start_lsn,
        confirmed_lsn: confirmed_rx,
        cancel: cancel.clone(),
    };
    let reader_task = tokio::spawn(reader.run(replication_client, events_tx));

    let interleaver = Interleaver::new(
        CaptureOptions {
            chunk_size: config.chunk_size,
            slot_name: config.slot_name.clone(),
            watermarks_stream,
            poll_timeout: config.poll_timeout(),
        },
        state,
        source,
        events_rx,
        emitter,
        confirmed_tx,
        cancel.clone(),
    );

    let result = match config.max_lifespan() {
        Some(lifespan) => match tokio::time::timeout(lifespan, interleaver.run()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(?lifespan, "max lifespan reached, ending capture");
                Ok(())
            }
        },
        None => interleaver.run().await,
    };

    cancel.cancel();
    let reader_result = match reader_task.await {
        Ok(result) => result,
        Err(e) => Err(ConnectorError::Internal(anyhow::anyhow!(
            "replication task panicked: {e}"
        ))),
    };

    match result {
        Ok(()) => Ok(()),
        // the reader's failure explains a dead event channel better than
        // the interleaver's symptom does
        Err(interleaver_err) => match reader_result {
            Err(reader_err) => Err(reader_err),
            Ok(()) => Err(interleaver_err),
        },
    }
}
