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

//! The per-cycle result-set buffer.
//!
//! Holds the most recent backfill chunk of each stream until the next
//! watermark drain has run over it. A change that races the scan query
//! (committed after the query's snapshot, for a key the query already
//! returned) is patched in here, so the flush emits the row's latest form
//! rather than the stale snapshot.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::source::{RowOp, ScannedRow};
use crate::state::StreamId;

/// One buffered chunk. Rows are keyed by the encoded scan-key tuple, so
/// iteration order is emission order.
pub struct Chunk {
    pub rows: BTreeMap<Vec<u8>, Map<String, Value>>,
    /// The chunk was shorter than the chunk size: the table is exhausted
    /// and the stream goes Active once this chunk is flushed.
    pub complete: bool,
    /// Highest key the scan returned; the resume position after flushing.
    pub high: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The row was overwritten, added, or removed.
    Applied,
    /// The key lies beyond the buffered range; a later chunk will cover it.
    OutOfRange,
    /// Nothing is buffered for the stream.
    NoChunk,
}

#[derive(Default)]
pub struct ResultSet {
    chunks: HashMap<StreamId, Chunk>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the freshly scanned chunk for `stream`.
    pub fn install(&mut self, stream: StreamId, rows: Vec<ScannedRow>, chunk_size: usize) {
        let complete = rows.len() < chunk_size;
        let mut map = BTreeMap::new();
        for row in rows {
            map.insert(row.key, row.fields);
        }
        let high = map.keys().next_back().cloned();
        self.chunks.insert(
            stream,
            Chunk {
                rows: map,
                complete,
                high,
            },
        );
    }

    /// Applies a replication event to the buffered chunk. Inserts and
    /// updates overwrite, deletes remove, and the last event for a key wins.
    /// A complete chunk covers every key above the resume position, so
    /// nothing is out of range for it.
    pub fn patch(
        &mut self,
        stream: &StreamId,
        op: RowOp,
        key: Vec<u8>,
        fields: Map<String, Value>,
    ) -> PatchOutcome {
        let Some(chunk) = self.chunks.get_mut(stream) else {
            return PatchOutcome::NoChunk;
        };
        let in_range =
            chunk.complete || chunk.high.as_deref().is_some_and(|high| key.as_slice() <= high);
        if !in_range {
            return PatchOutcome::OutOfRange;
        }
        match op {
            RowOp::Insert | RowOp::Update => {
                chunk.rows.insert(key, fields);
            }
            RowOp::Delete => {
                chunk.rows.remove(&key);
            }
        }
        PatchOutcome::Applied
    }

    pub fn is_buffered(&self, stream: &StreamId) -> bool {
        self.chunks.contains_key(stream)
    }

    /// Streams with a buffered chunk, in stream-id order.
    pub fn streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.chunks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn take(&mut self, stream: &StreamId) -> Option<Chunk> {
        self.chunks.remove(stream)
    }
}
