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

//! End-to-end interleaver scenarios against an in-memory database fake.
//!
//! The fake mirrors the one property that matters: a committed write shows
//! up both in subsequent scans and, in commit order, on the replication
//! channel. Writes scheduled `after` a watermark land in the log behind the
//! watermark's own change event, exactly like real writes racing a scan.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use expect_test::{expect, Expect};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_postgres::types::PgLsn;
use tokio_util::sync::CancellationToken;

use super::{CaptureOptions, Interleaver};
use crate::error::{ConnectorError, ConnectorResult};
use crate::message::{Emitter, Message};
use crate::source::{CaptureSource, ChangeEvent, RowEvent, RowOp, ScannedRow};
use crate::state::{CaptureState, StreamId, StreamMode, TableState};
use crate::tuple::{self, KeyValue};

const SLOT: &str = "test_slot";
const WATERMARKS: &str = "public.rivulet_watermarks";
const STREAM: &str = "public.t";

fn key(id: i64) -> Vec<u8> {
    tuple::encode(&[KeyValue::Int(id)])
}

fn fields(id: i64, v: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("id".to_owned(), Value::from(id));
    map.insert("v".to_owned(), Value::from(v));
    map
}

#[derive(Clone)]
enum Write {
    Upsert(&'static str, i64, &'static str),
    Delete(&'static str, i64),
}

struct FakeDb {
    tables: HashMap<StreamId, BTreeMap<Vec<u8>, Map<String, Value>>>,
    tx: mpsc::Sender<ChangeEvent>,
    lsn: u64,
}

impl FakeDb {
    fn send(&self, event: ChangeEvent) {
        // capacity is ample in tests; a closed channel is a scenario on its own
        let _ = self.tx.try_send(event);
    }

    // one committed transaction per write
    fn apply(&mut self, write: &Write) {
        self.lsn += 10;
        self.send(ChangeEvent::Begin {
            lsn: PgLsn::from(self.lsn),
        });
        let (op, stream, row) = match write {
            Write::Upsert(stream, id, v) => {
                let stream = (*stream).to_owned();
                let row = fields(*id, v);
                let existed = self
                    .tables
                    .entry(stream.clone())
                    .or_default()
                    .insert(key(*id), row.clone())
                    .is_some();
                (
                    if existed { RowOp::Update } else { RowOp::Insert },
                    stream,
                    row,
                )
            }
            Write::Delete(stream, id) => {
                let stream = (*stream).to_owned();
                self.tables.entry(stream.clone()).or_default().remove(&key(*id));
                let mut row = Map::new();
                row.insert("id".to_owned(), Value::from(*id));
                (RowOp::Delete, stream, row)
            }
        };
        let (namespace, table) = stream.split_once('.').unwrap();
        self.send(ChangeEvent::Row(RowEvent {
            op,
            namespace: namespace.to_owned(),
            table: table.to_owned(),
            fields: row,
            lsn: PgLsn::from(self.lsn + 2),
        }));
        self.send(ChangeEvent::Commit {
            lsn: PgLsn::from(self.lsn + 5),
        });
    }

    fn apply_watermark(&mut self, watermark: &str) {
        self.lsn += 10;
        self.send(ChangeEvent::Begin {
            lsn: PgLsn::from(self.lsn),
        });
        let mut row = Map::new();
        row.insert("slot".to_owned(), Value::from(SLOT));
        row.insert("watermark".to_owned(), Value::from(watermark));
        let (namespace, table) = WATERMARKS.split_once('.').unwrap();
        self.send(ChangeEvent::Row(RowEvent {
            op: RowOp::Update,
            namespace: namespace.to_owned(),
            table: table.to_owned(),
            fields: row,
            lsn: PgLsn::from(self.lsn + 2),
        }));
        self.send(ChangeEvent::Commit {
            lsn: PgLsn::from(self.lsn + 5),
        });
    }
}

/// Writes scheduled around one watermark upsert: `before` commits ahead of
/// the fence, `after` commits behind it but ahead of the following scan.
#[derive(Default, Clone)]
struct Cycle {
    before: Vec<Write>,
    after: Vec<Write>,
}

struct FakeSource {
    db: Arc<Mutex<FakeDb>>,
    script: VecDeque<Cycle>,
    watermark_seq: u64,
    scan_resumes: Arc<Mutex<Vec<(StreamId, Option<Vec<u8>>)>>>,
}

#[async_trait]
impl CaptureSource for FakeSource {
    async fn write_watermark(&mut self) -> ConnectorResult<String> {
        let cycle = self.script.pop_front().unwrap_or_default();
        self.watermark_seq += 1;
        let watermark = format!("wm-{}", self.watermark_seq);

        let mut db = self.db.lock().unwrap();
        for write in &cycle.before {
            db.apply(write);
        }
        db.apply_watermark(&watermark);
        for write in &cycle.after {
            db.apply(write);
        }
        Ok(watermark)
    }

    async fn scan_chunk(
        &mut self,
        stream: &StreamId,
        _scan_key: &[String],
        resume: Option<&[u8]>,
        limit: usize,
    ) -> ConnectorResult<Vec<ScannedRow>> {
        self.scan_resumes
            .lock()
            .unwrap()
            .push((stream.clone(), resume.map(|r| r.to_vec())));
        let db = self.db.lock().unwrap();
        let rows = db
            .tables
            .get(stream)
            .map(|table| {
                table
                    .iter()
                    .filter(|(k, _)| resume.map_or(true, |r| k.as_slice() > r))
                    .take(limit)
                    .map(|(k, row)| ScannedRow {
                        key: k.clone(),
                        fields: row.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

#[derive(Clone, Default)]
struct SharedEmitter(Arc<Mutex<Vec<Message>>>);

impl Emitter for SharedEmitter {
    fn emit(&mut self, message: Message) -> ConnectorResult<()> {
        self.0.lock().unwrap().push(message);
        Ok(())
    }
}

struct Harness {
    source: FakeSource,
    state: CaptureState,
    events_rx: mpsc::Receiver<ChangeEvent>,
    emitter: SharedEmitter,
    cancel: CancellationToken,
    chunk_size: usize,
}

impl Harness {
    fn new(chunk_size: usize) -> Self {
        let (tx, events_rx) = mpsc::channel(4096);
        let db = FakeDb {
            tables: HashMap::new(),
            tx,
            lsn: 0,
        };
        Self {
            source: FakeSource {
                db: Arc::new(Mutex::new(db)),
                script: VecDeque::new(),
                watermark_seq: 0,
                scan_resumes: Arc::new(Mutex::new(Vec::new())),
            },
            state: CaptureState::default(),
            events_rx,
            emitter: SharedEmitter::default(),
            cancel: CancellationToken::new(),
            chunk_size,
        }
    }

    fn with_table(self, stream: &str, rows: &[(i64, &str)]) -> Self {
        {
            let mut db = self.source.db.lock().unwrap();
            let table = db.tables.entry(stream.to_owned()).or_default();
            for (id, v) in rows {
                table.insert(key(*id), fields(*id, v));
            }
        }
        self
    }

    fn with_stream(mut self, stream: &str, mode: StreamMode, scanned: Option<i64>) -> Self {
        self.state.streams.insert(
            stream.to_owned(),
            TableState {
                mode,
                scan_key: vec!["id".to_owned()],
                scanned: scanned.map(|id| hex::encode(key(id))),
            },
        );
        self
    }

    fn with_script(mut self, script: Vec<Cycle>) -> Self {
        self.source.script = script.into();
        self
    }

    async fn run(self) -> (ConnectorResult<()>, Vec<Message>) {
        let options = CaptureOptions {
            chunk_size: self.chunk_size,
            slot_name: SLOT.to_owned(),
            watermarks_stream: WATERMARKS.to_owned(),
            poll_timeout: Some(Duration::from_millis(100)),
        };
        let (confirmed_tx, _confirmed_rx) = watch::channel(PgLsn::from(0));
        let emitter = self.emitter.clone();
        let interleaver = Interleaver::new(
            options,
            self.state,
            self.source,
            self.events_rx,
            emitter,
            confirmed_tx,
            self.cancel,
        );
        let result = interleaver.run().await;
        let messages = self.emitter.0.lock().unwrap().clone();
        (result, messages)
    }
}

fn render(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        match message {
            Message::Record(r) => {
                out.push_str(&format!(
                    "record {}.{} {} {}\n",
                    r.namespace.as_deref().unwrap_or("?"),
                    r.stream,
                    r.op,
                    serde_json::to_string(&r.data).unwrap(),
                ));
            }
            Message::State(s) => {
                out.push_str(&format!("state {}\n", render_state(&s.data)));
            }
            Message::Log(l) => {
                out.push_str(&format!("log {} {}\n", l.level, l.message));
            }
        }
    }
    out
}

fn render_state(data: &Value) -> String {
    let position = data["current_log_position"].as_str().unwrap();
    let mut parts = vec![position.to_owned()];
    for (id, table) in data["streams"].as_object().unwrap() {
        let mode = table["mode"].as_str().unwrap();
        let scanned = table
            .get("scanned")
            .and_then(|s| s.as_str())
            .map(|s| {
                let decoded = tuple::decode(&hex::decode(s).unwrap()).unwrap();
                let ids: Vec<String> = decoded
                    .iter()
                    .map(|v| match v {
                        KeyValue::Int(i) => i.to_string(),
                        other => format!("{other:?}"),
                    })
                    .collect();
                format!(" scanned=({})", ids.join(","))
            })
            .unwrap_or_default();
        parts.push(format!("{id}={mode}{scanned}"));
    }
    parts.join(" ")
}

async fn check(harness: Harness, expected: Expect) {
    let (result, messages) = harness.run().await;
    result.unwrap();
    expected.assert_eq(&render(&messages));
}

// An empty table backfills in one cycle; a row inserted after the stream
// goes active arrives through streaming with a trailing checkpoint.
#[tokio::test(start_paused = true)]
async fn test_empty_table_then_streaming_insert() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[])
        .with_stream(STREAM, StreamMode::Backfill, None)
        .with_script(vec![
            Cycle::default(),
            Cycle {
                before: vec![],
                after: vec![Write::Upsert(STREAM, 1, "a")],
            },
        ]);
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.t=backfill
            state 0/19 public.t=active
            record public.t insert {"id":1,"v":"a"}
            state 0/23 public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// Pure backfill: chunked scans advance the resume key, the final short
// chunk promotes the stream, and each flush checkpoints once.
#[tokio::test(start_paused = true)]
async fn test_pure_backfill_chunks() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[(1, "a"), (2, "b"), (3, "c")])
        .with_stream(STREAM, StreamMode::Backfill, None);
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.t=backfill
            record public.t insert {"id":1,"v":"a"}
            record public.t insert {"id":2,"v":"b"}
            state 0/19 public.t=backfill scanned=(2)
            record public.t insert {"id":3,"v":"c"}
            state 0/23 public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// Writes racing the first scan: the update lands in its latest form via the
// buffer patch, and the insert beyond the chunk is covered by a later scan.
#[tokio::test(start_paused = true)]
async fn test_update_and_insert_racing_backfill() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[(1, "a"), (2, "b"), (3, "c"), (4, "d")])
        .with_stream(STREAM, StreamMode::Backfill, None)
        .with_script(vec![Cycle {
            before: vec![],
            after: vec![Write::Upsert(STREAM, 2, "x"), Write::Upsert(STREAM, 5, "y")],
        }]);
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.t=backfill
            record public.t insert {"id":1,"v":"a"}
            record public.t insert {"id":2,"v":"x"}
            state 0/2D public.t=backfill scanned=(2)
            record public.t insert {"id":3,"v":"c"}
            record public.t insert {"id":4,"v":"d"}
            state 0/37 public.t=backfill scanned=(4)
            record public.t insert {"id":5,"v":"y"}
            state 0/41 public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// A row deleted between the fence and the scan never surfaces: no record,
// no delete event. From the merged stream's view it never existed.
#[tokio::test(start_paused = true)]
async fn test_delete_racing_backfill() {
    let harness = Harness::new(3)
        .with_table(STREAM, &[(1, "a"), (2, "b"), (3, "c")])
        .with_stream(STREAM, StreamMode::Backfill, None)
        .with_script(vec![Cycle {
            before: vec![],
            after: vec![Write::Delete(STREAM, 2)],
        }]);
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.t=backfill
            record public.t insert {"id":1,"v":"a"}
            record public.t insert {"id":3,"v":"c"}
            state 0/23 public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// Restarting from a mid-backfill checkpoint resumes strictly after the
// persisted key: no overlap with what was already emitted, no gap.
#[tokio::test(start_paused = true)]
async fn test_restart_mid_backfill_resumes() {
    let mut harness = Harness::new(2)
        .with_table(STREAM, &[(1, "a"), (2, "b"), (3, "c")])
        .with_stream(STREAM, StreamMode::Backfill, Some(2));
    harness.state.current_log_position = "0/19".to_owned();
    {
        harness.source.db.lock().unwrap().lsn = 100;
    }
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/19 public.t=backfill scanned=(2)
            record public.t insert {"id":3,"v":"c"}
            state 0/7D public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// A stream dropped from the catalog disappears from the emitted state and
// produces no events; reconciliation already removed its entry.
#[tokio::test(start_paused = true)]
async fn test_catalog_removal_state_only_carries_configured_streams() {
    let harness = Harness::new(2)
        .with_table("public.a", &[])
        .with_stream("public.a", StreamMode::Active, None);
    // public.b existed in a previous run; it is simply absent now
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.a=active
            log info capture finished
        "#]],
    )
    .await;
}

// While backfilling, events at or below the persisted resume key are
// emitted directly; the streaming phase then carries deletes as deletes.
#[tokio::test(start_paused = true)]
async fn test_direct_emission_below_resume_key_and_streamed_delete() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")])
        .with_stream(STREAM, StreamMode::Backfill, Some(2))
        .with_script(vec![
            Cycle {
                before: vec![Write::Upsert(STREAM, 1, "a2")],
                after: vec![],
            },
            Cycle::default(),
            Cycle {
                before: vec![],
                after: vec![Write::Delete(STREAM, 5)],
            },
        ]);
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.t=backfill scanned=(2)
            record public.t update {"id":1,"v":"a2"}
            state 0/19 public.t=backfill scanned=(2)
            record public.t insert {"id":3,"v":"c"}
            record public.t insert {"id":4,"v":"d"}
            state 0/23 public.t=backfill scanned=(4)
            record public.t insert {"id":5,"v":"e"}
            state 0/2D public.t=active
            record public.t delete {"id":5}
            state 0/37 public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// Chunk boundary: a table of kN + r rows needs exactly k+1 scans, resuming
// from the last key of each full chunk.
#[tokio::test(start_paused = true)]
async fn test_chunk_boundary_scan_count() {
    let harness = Harness::new(2)
        .with_table(
            STREAM,
            &[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")],
        )
        .with_stream(STREAM, StreamMode::Backfill, None);
    let scans = harness.source.scan_resumes.clone();
    let (result, _messages) = harness.run().await;
    result.unwrap();

    let scans = scans.lock().unwrap();
    let resumes: Vec<Option<Vec<u8>>> = scans.iter().map(|(_, r)| r.clone()).collect();
    assert_eq!(
        resumes,
        vec![None, Some(key(2)), Some(key(4))],
        "5 rows at chunk size 2 take exactly 3 scans"
    );
}

// Commits that emitted nothing since the last checkpoint do not checkpoint,
// even though they advance the internal position.
#[tokio::test(start_paused = true)]
async fn test_empty_commit_suppression() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[])
        .with_stream(STREAM, StreamMode::Active, None);
    {
        // a transaction on an unconfigured stream, then one on the active stream
        let mut db = harness.source.db.lock().unwrap();
        db.apply(&Write::Upsert("public.other", 1, "x"));
        db.apply(&Write::Upsert(STREAM, 7, "v"));
    }
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.t=active
            record public.t insert {"id":7,"v":"v"}
            state 0/19 public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// Per-key ordering through streaming: insert, update, delete arrive in
// commit order with a checkpoint after each committing transaction.
#[tokio::test(start_paused = true)]
async fn test_streaming_per_key_order() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[])
        .with_stream(STREAM, StreamMode::Active, None);
    {
        let mut db = harness.source.db.lock().unwrap();
        db.apply(&Write::Upsert(STREAM, 7, "a"));
        db.apply(&Write::Upsert(STREAM, 7, "b"));
        db.apply(&Write::Delete(STREAM, 7));
    }
    check(
        harness,
        expect![[r#"
            log info capture started
            state 0/0 public.t=active
            record public.t insert {"id":7,"v":"a"}
            state 0/F public.t=active
            record public.t update {"id":7,"v":"b"}
            state 0/19 public.t=active
            record public.t delete {"id":7}
            state 0/23 public.t=active
            log info capture finished
        "#]],
    )
    .await;
}

// Cancellation before any progress returns cleanly without emitting a
// partial checkpoint beyond the initial one.
#[tokio::test(start_paused = true)]
async fn test_cancellation_is_clean() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[(1, "a")])
        .with_stream(STREAM, StreamMode::Backfill, None);
    harness.cancel.cancel();
    let (result, messages) = harness.run().await;
    result.unwrap();
    let rendered = render(&messages);
    assert!(rendered.ends_with("log info capture finished\n"), "{rendered}");
    assert!(
        !rendered.contains("record"),
        "no records may be emitted after cancellation: {rendered}"
    );
}

// A replication channel that dies mid-capture is a fatal error, not a hang.
#[tokio::test(start_paused = true)]
async fn test_channel_close_is_fatal() {
    let mut harness = Harness::new(2)
        .with_table(STREAM, &[(1, "a")])
        .with_stream(STREAM, StreamMode::Backfill, None);
    // replace the db sender so the channel has no live producer
    let (dead_tx, dead_rx) = mpsc::channel(1);
    drop(dead_rx);
    harness.source.db.lock().unwrap().tx = dead_tx;
    let (result, _messages) = harness.run().await;
    assert!(matches!(result, Err(ConnectorError::Decode(_))));
}

// Ignored streams produce nothing, in either phase.
#[tokio::test(start_paused = true)]
async fn test_ignored_stream_is_silent() {
    let harness = Harness::new(2)
        .with_table(STREAM, &[(1, "a")])
        .with_table("public.skip", &[(9, "z")])
        .with_stream(STREAM, StreamMode::Backfill, None)
        .with_stream("public.skip", StreamMode::Ignore, None)
        .with_script(vec![Cycle {
            before: vec![Write::Upsert("public.skip", 10, "zz")],
            after: vec![],
        }]);
    let (result, messages) = harness.run().await;
    result.unwrap();
    let rendered = render(&messages);
    assert!(!rendered.contains("record public.skip"), "{rendered}");
}
