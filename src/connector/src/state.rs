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

//! Persistent capture state: the replication log position plus one
//! [`TableState`] per configured stream. The interleaver is the only
//! mutator; everything else receives `&` access or value copies.

use std::collections::BTreeMap;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::PgLsn;

use crate::catalog::ConfiguredCatalog;
use crate::error::{ConnectorError, ConnectorResult};

/// Fully-qualified, case-normalized `namespace.table` identifier.
pub type StreamId = String;

pub fn stream_id(namespace: &str, table: &str) -> StreamId {
    format!("{}.{}", namespace.to_lowercase(), table.to_lowercase())
}

/// Splits a stream id back into `(namespace, table)`.
pub fn split_stream_id(id: &str) -> ConnectorResult<(&str, &str)> {
    id.split_once('.')
        .filter(|(ns, table)| !ns.is_empty() && !table.is_empty())
        .ok_or_else(|| ConnectorError::Catalog(format!("malformed stream id {id:?}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Still being bulk-scanned in keyed chunks.
    Backfill,
    /// Backfill finished; replication events are emitted directly.
    Active,
    /// Configured to be skipped.
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    pub mode: StreamMode,
    /// Columns ordering the chunked scan. Immutable once persisted.
    pub scan_key: Vec<String>,
    /// Hex form of the highest scan-key tuple emitted so far, present only
    /// while backfilling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanned: Option<String>,
}

impl TableState {
    pub fn scanned_key(&self) -> ConnectorResult<Option<Vec<u8>>> {
        self.scanned
            .as_deref()
            .map(|s| {
                hex::decode(s)
                    .map_err(|e| ConnectorError::Decode(format!("corrupt scanned key: {e}")))
            })
            .transpose()
    }

    pub fn set_scanned_key(&mut self, key: Option<&[u8]>) {
        self.scanned = key.map(hex::encode);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureState {
    /// Last checkpointed replication position, `X/X` form. Never decreases.
    pub current_log_position: String,
    pub streams: BTreeMap<StreamId, TableState>,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self {
            current_log_position: PgLsn::from(0).to_string(),
            streams: BTreeMap::new(),
        }
    }
}

impl CaptureState {
    /// Restores the state from the resumption blob, or starts fresh.
    pub fn restore(blob: Option<&str>) -> ConnectorResult<Self> {
        match blob {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|e| ConnectorError::Decode(format!("corrupt state blob: {e}"))),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("state is always serializable")
    }

    pub fn lsn(&self) -> ConnectorResult<PgLsn> {
        PgLsn::from_str(&self.current_log_position).map_err(|_| {
            ConnectorError::Decode(format!(
                "corrupt log position {:?}",
                self.current_log_position
            ))
        })
    }

    /// Advances the checkpointed position; positions never move backwards.
    pub fn advance_lsn(&mut self, lsn: PgLsn) -> ConnectorResult<()> {
        if lsn > self.lsn()? {
            self.current_log_position = lsn.to_string();
        }
        Ok(())
    }

    /// Reconciles the stored table states against the configured catalog and
    /// the primary keys discovered in the database.
    ///
    /// New streams start in `Backfill` with the catalog-override-else-database
    /// scan key; streams dropped from the catalog are removed; a catalog key
    /// that conflicts with a previously persisted scan key is an error, as is
    /// a stream with no key at all.
    pub fn reconcile(
        &mut self,
        catalog: &ConfiguredCatalog,
        discovered_keys: &BTreeMap<StreamId, Vec<String>>,
        watermarks_stream: &StreamId,
    ) -> ConnectorResult<()> {
        let mut configured: BTreeMap<StreamId, &crate::catalog::ConfiguredStream> =
            BTreeMap::new();
        for stream in &catalog.streams {
            let id = stream.stream_id();
            if &id == watermarks_stream {
                return Err(ConnectorError::Catalog(format!(
                    "the watermarks table {id:?} cannot be captured as a stream"
                )));
            }
            if configured.insert(id.clone(), stream).is_some() {
                return Err(ConnectorError::Catalog(format!(
                    "stream {id:?} appears twice in the catalog"
                )));
            }
        }

        self.streams.retain(|id, _| configured.contains_key(id));

        for (id, stream) in configured {
            if stream.ignore {
                self.streams.insert(
                    id,
                    TableState {
                        mode: StreamMode::Ignore,
                        scan_key: stream.primary_key.clone().unwrap_or_default(),
                        scanned: None,
                    },
                );
                continue;
            }

            let resolved_key = match (&stream.primary_key, discovered_keys.get(&id)) {
                (Some(key), _) if !key.is_empty() => key.clone(),
                (_, Some(key)) if !key.is_empty() => key.clone(),
                _ => {
                    return Err(ConnectorError::Catalog(format!(
                        "stream {id:?} has no primary key and no configured scan key"
                    )))
                }
            };

            match self.streams.get_mut(&id) {
                Some(existing) if existing.mode != StreamMode::Ignore => {
                    if let Some(key) = &stream.primary_key {
                        if key != &existing.scan_key {
                            return Err(ConnectorError::Catalog(format!(
                                "stream {id:?} scan key {key:?} conflicts with persisted {:?}",
                                existing.scan_key
                            )));
                        }
                    }
                }
                _ => {
                    // fresh stream, or one coming back from Ignore
                    self.streams.insert(
                        id,
                        TableState {
                            mode: StreamMode::Backfill,
                            scan_key: resolved_key,
                            scanned: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Sorted ids of streams still backfilling.
    pub fn pending_streams(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, table)| table.mode == StreamMode::Backfill)
            .map(|(id, _)| id.clone())
            .collect_vec()
    }
}
