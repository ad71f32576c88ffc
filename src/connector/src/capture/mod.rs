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

//! The watermark interleaver: merges keyed backfill chunks with the
//! replication stream into one consistent, resumable record stream.
//!
//! Interleaving algorithm, per cycle while any stream is still backfilling:
//!
//!  1. Upsert a fresh watermark UUID into the watermarks table. Its change
//!     event will come back on the replication stream at some position L(W).
//!  2. Drain replication events until the watermark is observed, then until
//!     the enclosing transaction commits. Events for already-backfilled key
//!     ranges are emitted directly; events for the currently buffered chunk
//!     are patched into it; events beyond the buffered range are dropped,
//!     because a later chunk scan reads their committed state anyway.
//!  3. Flush the buffered chunk of every stream in encoded-key order. A
//!     chunk shorter than the chunk size exhausts its table: the stream is
//!     promoted to Active and its resume position cleared.
//!  4. Checkpoint. Safe because every event at or below L(W) has either
//!     been emitted or is reflected in the rows just flushed, and every
//!     event above L(W) is still unread and will replay after a restart.
//!  5. Scan the next chunk of each pending stream and buffer it. The next
//!     cycle's drain runs over these rows before they are emitted, which is
//!     what makes scan-racing changes land in their latest form.
//!
//! Once no stream is pending the loop degenerates to streaming: translate
//! and emit Active-stream events, checkpointing on every commit that both
//! advanced the position and follows at least one emitted record.

mod buffer;

#[cfg(test)]
mod tests;

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;
use tokio_util::sync::CancellationToken;

pub use self::buffer::{Chunk, PatchOutcome, ResultSet};
use crate::error::{ConnectorError, ConnectorResult};
use crate::message::{Emitter, Message};
use crate::parser;
use crate::source::{CaptureSource, ChangeEvent, RowEvent, RowOp};
use crate::state::{split_stream_id, CaptureState, StreamId, StreamMode};

pub struct CaptureOptions {
    pub chunk_size: usize,
    pub slot_name: String,
    /// Stream id of the watermarks table; its events fence the cycles and
    /// are never emitted downstream.
    pub watermarks_stream: StreamId,
    /// Non-tailing mode: end the capture once nothing has been emitted for
    /// this long.
    pub poll_timeout: Option<Duration>,
}

pub struct Interleaver<S: CaptureSource, E: Emitter> {
    options: CaptureOptions,
    state: CaptureState,
    buffer: ResultSet,
    source: S,
    events: mpsc::Receiver<ChangeEvent>,
    emitter: E,
    /// Latest checkpointed position, consumed by the replication reader for
    /// standby status updates. Only checkpointed positions may be confirmed.
    confirmed_tx: watch::Sender<PgLsn>,
    cancel: CancellationToken,
    records_since_checkpoint: usize,
    last_emit: Instant,
}

/// Why an event loop stopped waiting.
enum Wait {
    Event(ChangeEvent),
    /// Cancelled or poll-timeout expired; finish cleanly.
    Finished,
}

impl<S: CaptureSource, E: Emitter> Interleaver<S, E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: CaptureOptions,
        state: CaptureState,
        source: S,
        events: mpsc::Receiver<ChangeEvent>,
        emitter: E,
        confirmed_tx: watch::Sender<PgLsn>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            state,
            buffer: ResultSet::new(),
            source,
            events,
            emitter,
            confirmed_tx,
            cancel,
            records_since_checkpoint: 0,
            last_emit: Instant::now(),
        }
    }

    pub async fn run(mut self) -> ConnectorResult<()> {
        let pending = self.state.pending_streams();
        tracing::info!(
            position = %self.state.current_log_position,
            pending = pending.len(),
            "starting capture",
        );
        self.emitter
            .emit(Message::log("info", "capture started"))?;

        // the resumption point is re-announced so a fresh invocation always
        // begins with a consistent checkpoint
        self.checkpoint()?;

        while !self.state.pending_streams().is_empty() {
            if !self.backfill_cycle().await? {
                return self.finish();
            }
        }

        tracing::info!("all streams active, switching to streaming");
        self.streaming().await
    }

    /// One fence/drain/flush/checkpoint/scan cycle. Returns `false` when the
    /// capture should end cleanly instead of continuing.
    async fn backfill_cycle(&mut self) -> ConnectorResult<bool> {
        let watermark = self.source.write_watermark().await?;
        tracing::debug!(watermark = %watermark, "fenced backfill cycle");

        if !self.drain_to_watermark(&watermark).await? {
            return Ok(false);
        }
        self.flush()?;
        self.scan_pending().await?;
        Ok(true)
    }

    /// Reads events until the fence's change event and its commit have been
    /// observed. Blocking here until the watermark appears is intentional;
    /// only the poll timeout or cancellation cuts it short.
    async fn drain_to_watermark(&mut self, watermark: &str) -> ConnectorResult<bool> {
        let mut fence_seen = false;
        loop {
            match self.next_event().await? {
                Wait::Finished => return Ok(false),
                Wait::Event(ChangeEvent::Begin { .. }) => {}
                Wait::Event(ChangeEvent::Commit { lsn }) => {
                    self.state.advance_lsn(lsn)?;
                    if fence_seen {
                        return Ok(true);
                    }
                }
                Wait::Event(ChangeEvent::Row(event)) => {
                    let stream = event.stream_id();
                    if stream == self.options.watermarks_stream {
                        if self.is_own_watermark(&event, watermark) {
                            fence_seen = true;
                        }
                        continue;
                    }
                    self.dispatch_backfill_row(stream, event)?;
                }
            }
        }
    }

    fn is_own_watermark(&self, event: &RowEvent, watermark: &str) -> bool {
        let slot = event.fields.get("slot").and_then(|v| v.as_str());
        let value = event.fields.get("watermark").and_then(|v| v.as_str());
        slot == Some(self.options.slot_name.as_str()) && value == Some(watermark)
    }

    /// Routes one drained row event by the mode of its stream.
    fn dispatch_backfill_row(
        &mut self,
        stream: StreamId,
        event: RowEvent,
    ) -> ConnectorResult<()> {
        let Some(table) = self.state.streams.get(&stream) else {
            tracing::trace!(stream = %stream, "dropping event for unconfigured stream");
            return Ok(());
        };
        match table.mode {
            StreamMode::Ignore => Ok(()),
            StreamMode::Active => self.emit_event(event),
            StreamMode::Backfill => {
                let key = parser::row_key(&stream, &event.fields, &table.scan_key)?;
                let already_backfilled = match table.scanned_key()? {
                    Some(scanned) => key <= scanned,
                    None => false,
                };
                if already_backfilled {
                    self.emit_event(event)
                } else {
                    match self.buffer.patch(&stream, event.op, key, event.fields) {
                        PatchOutcome::Applied => {}
                        PatchOutcome::OutOfRange | PatchOutcome::NoChunk => {
                            // the committed row is picked up by a later scan
                            tracing::trace!(stream = %stream, "event beyond buffered chunk dropped");
                        }
                    }
                    Ok(())
                }
            }
        }
    }

    /// Emits every buffered chunk in key order, then advances table states:
    /// short chunks promote their stream to Active, full chunks move the
    /// resume position to the chunk's last key. Checkpoints when anything
    /// was emitted since the last one.
    fn flush(&mut self) -> ConnectorResult<()> {
        let mut flushed = false;
        for stream in self.buffer.streams() {
            let chunk = self.buffer.take(&stream).expect("stream listed as buffered");
            let (namespace, table) = {
                let (ns, t) = split_stream_id(&stream)?;
                (ns.to_owned(), t.to_owned())
            };
            let row_count = chunk.rows.len();
            for (_key, fields) in chunk.rows {
                self.emit_record(&namespace, &table, "insert", fields)?;
            }

            let entry = self
                .state
                .streams
                .get_mut(&stream)
                .ok_or_else(|| ConnectorError::Catalog(format!("lost state for {stream}")))?;
            if chunk.complete {
                entry.mode = StreamMode::Active;
                entry.set_scanned_key(None);
                tracing::info!(stream = %stream, row_count, "backfill complete, stream active");
            } else {
                entry.set_scanned_key(chunk.high.as_deref());
                tracing::debug!(stream = %stream, row_count, "flushed backfill chunk");
            }
            flushed = true;
        }
        if flushed || self.records_since_checkpoint > 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    async fn scan_pending(&mut self) -> ConnectorResult<()> {
        for stream in self.state.pending_streams() {
            let (scan_key, resume) = {
                let table = &self.state.streams[&stream];
                (table.scan_key.clone(), table.scanned_key()?)
            };
            let rows = self
                .source
                .scan_chunk(
                    &stream,
                    &scan_key,
                    resume.as_deref(),
                    self.options.chunk_size,
                )
                .await?;
            tracing::debug!(stream = %stream, rows = rows.len(), "scanned backfill chunk");
            self.buffer
                .install(stream, rows, self.options.chunk_size);
        }
        Ok(())
    }

    /// Phase 2: emit Active-stream events as they commit.
    async fn streaming(&mut self) -> ConnectorResult<()> {
        loop {
            match self.next_event().await? {
                Wait::Finished => return self.finish(),
                Wait::Event(ChangeEvent::Begin { .. }) => {}
                Wait::Event(ChangeEvent::Commit { lsn }) => {
                    let advanced = lsn > self.state.lsn()?;
                    self.state.advance_lsn(lsn)?;
                    // a commit with nothing emitted since the last checkpoint
                    // would re-announce an identical state; skip it
                    if advanced && self.records_since_checkpoint > 0 {
                        self.checkpoint()?;
                    }
                }
                Wait::Event(ChangeEvent::Row(event)) => {
                    let stream = event.stream_id();
                    if stream == self.options.watermarks_stream {
                        continue;
                    }
                    match self.state.streams.get(&stream).map(|t| t.mode) {
                        Some(StreamMode::Active) => self.emit_event(event)?,
                        _ => tracing::trace!(stream = %stream, "dropping event for inactive stream"),
                    }
                }
            }
        }
    }

    /// Waits for the next replication event, honoring cancellation and the
    /// no-progress watchdog.
    async fn next_event(&mut self) -> ConnectorResult<Wait> {
        // biased so that cancellation wins over an already-full channel
        let received = if let Some(poll_timeout) = self.options.poll_timeout {
            let deadline = self.last_emit + poll_timeout;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Wait::Finished),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(?poll_timeout, "no records within poll timeout, ending capture");
                    return Ok(Wait::Finished);
                }
                received = self.events.recv() => received,
            }
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Wait::Finished),
                received = self.events.recv() => received,
            }
        };
        match received {
            Some(event) => Ok(Wait::Event(event)),
            None if self.cancel.is_cancelled() => Ok(Wait::Finished),
            None => Err(ConnectorError::Decode(
                "replication event channel closed unexpectedly".into(),
            )),
        }
    }

    fn emit_event(&mut self, event: RowEvent) -> ConnectorResult<()> {
        let op = match event.op {
            RowOp::Insert => "insert",
            RowOp::Update => "update",
            RowOp::Delete => "delete",
        };
        self.emit_record(&event.namespace, &event.table, op, event.fields)
    }

    fn emit_record(
        &mut self,
        namespace: &str,
        table: &str,
        op: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> ConnectorResult<()> {
        self.emitter
            .emit(Message::record(namespace, table, op, fields))?;
        self.records_since_checkpoint += 1;
        self.last_emit = Instant::now();
        Ok(())
    }

    /// Emits the persistent state and publishes the position to the
    /// replication reader. Called only at consistent points.
    fn checkpoint(&mut self) -> ConnectorResult<()> {
        self.emitter.emit(Message::state(self.state.to_json()))?;
        self.records_since_checkpoint = 0;
        self.confirmed_tx.send_replace(self.state.lsn()?);
        Ok(())
    }

    fn finish(&mut self) -> ConnectorResult<()> {
        tracing::info!("capture finished cleanly");
        self.emitter
            .emit(Message::log("info", "capture finished"))?;
        Ok(())
    }
}
