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

pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_postgres::types::PgLsn;

use crate::error::ConnectorResult;
use crate::state::{stream_id, StreamId};

/// A decoded change from the logical replication log. Row events within one
/// transaction arrive in source order, framed by a `Begin`/`Commit` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Begin { lsn: PgLsn },
    Row(RowEvent),
    Commit { lsn: PgLsn },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub op: RowOp,
    pub namespace: String,
    pub table: String,
    pub fields: Map<String, Value>,
    pub lsn: PgLsn,
}

impl RowEvent {
    pub fn stream_id(&self) -> StreamId {
        stream_id(&self.namespace, &self.table)
    }
}

/// One row of a backfill chunk: the encoded scan-key tuple plus the
/// translated fields.
#[derive(Debug, Clone)]
pub struct ScannedRow {
    pub key: Vec<u8>,
    pub fields: Map<String, Value>,
}

/// The database operations the interleaver drives synchronously: writing the
/// fence and extending backfills. Replication events arrive separately on a
/// bounded channel. Tests substitute an in-memory implementation.
#[async_trait]
pub trait CaptureSource: Send {
    /// Upserts a fresh watermark UUID for this capture's slot and returns it.
    async fn write_watermark(&mut self) -> ConnectorResult<String>;

    /// Returns up to `limit` rows of `stream` whose scan-key tuple is
    /// strictly greater than `resume`, in ascending key order.
    async fn scan_chunk(
        &mut self,
        stream: &StreamId,
        scan_key: &[String],
        resume: Option<&[u8]>,
        limit: usize,
    ) -> ConnectorResult<Vec<ScannedRow>>;
}
