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

//! The replication stream reader.
//!
//! Owns the dedicated replication connection, decodes pgoutput messages into
//! [`ChangeEvent`]s on a bounded channel, answers server keepalives, and
//! periodically reports the interleaver's checkpointed position so the
//! server can release upstream log.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;
use postgres_protocol::message::backend::{
    LogicalReplicationMessage, RelationBody, ReplicationMessage, Tuple, TupleData,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_postgres::replication::LogicalReplicationStream;
use tokio_postgres::types::PgLsn;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectorError, ConnectorResult};
use crate::parser;
use crate::source::{ChangeEvent, RowEvent, RowOp};

/// How often the reader volunteers a standby status update.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Column names and type OIDs of a relation, learned from the Relation
/// message that precedes its first change in every session.
struct RelationSchema {
    namespace: String,
    table: String,
    columns: Vec<(String, u32)>,
}

pub struct ReplicationReader {
    pub slot_name: String,
    pub publication_name: String,
    /// Replay starts here; everything at or below has been checkpointed.
    pub start_lsn: PgLsn,
    /// Latest checkpointed position, fed by the interleaver. Only
    /// checkpointed positions are ever confirmed to the server.
    pub confirmed_lsn: watch::Receiver<PgLsn>,
    pub cancel: CancellationToken,
}

impl ReplicationReader {
    /// Runs until cancelled, the consumer goes away, or the session fails.
    /// Dropping the sender on return closes the channel and unblocks the
    /// consumer.
    pub async fn run(
        mut self,
        client: Client,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> ConnectorResult<()> {
        let query = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL {} (\"proto_version\" '1', \"publication_names\" '{}')",
            self.slot_name, self.start_lsn, self.publication_name,
        );
        tracing::info!(
            slot = %self.slot_name,
            publication = %self.publication_name,
            start_lsn = %self.start_lsn,
            "starting replication",
        );

        let duplex = client.copy_both_simple::<bytes::Bytes>(&query).await?;
        let mut stream = Box::pin(LogicalReplicationStream::new(duplex));

        let mut relations: HashMap<u32, RelationSchema> = HashMap::new();
        let mut status = tokio::time::interval(STATUS_INTERVAL);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(slot = %self.slot_name, "replication reader cancelled");
                    return Ok(());
                }
                _ = status.tick() => {
                    self.send_status(stream.as_mut(), false).await?;
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        return Err(ConnectorError::Decode(
                            "replication stream ended unexpectedly".into(),
                        ));
                    };
                    match message? {
                        ReplicationMessage::XLogData(body) => {
                            let lsn = PgLsn::from(body.wal_start());
                            if let Some(event) =
                                decode_message(&mut relations, lsn, body.into_data())?
                            {
                                if tx.send(event).await.is_err() {
                                    // consumer is gone; shut down quietly
                                    return Ok(());
                                }
                            }
                        }
                        ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                            if keepalive.reply() == 1 {
                                self.send_status(stream.as_mut(), true).await?;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn send_status(
        &mut self,
        stream: Pin<&mut LogicalReplicationStream>,
        reply: bool,
    ) -> ConnectorResult<()> {
        let lsn = *self.confirmed_lsn.borrow_and_update();
        let ts = postgres_epoch_micros();
        stream
            .standby_status_update(lsn, lsn, lsn, ts, reply.into())
            .await?;
        tracing::trace!(confirmed = %lsn, "sent standby status update");
        Ok(())
    }
}

// microseconds since 2000-01-01, the epoch of the replication protocol
fn postgres_epoch_micros() -> i64 {
    const POSTGRES_EPOCH_UNIX_SECONDS: i64 = 946_684_800;
    chrono::Utc::now().timestamp_micros() - POSTGRES_EPOCH_UNIX_SECONDS * 1_000_000
}

fn decode_message(
    relations: &mut HashMap<u32, RelationSchema>,
    lsn: PgLsn,
    message: LogicalReplicationMessage,
) -> ConnectorResult<Option<ChangeEvent>> {
    let event = match message {
        LogicalReplicationMessage::Begin(begin) => Some(ChangeEvent::Begin {
            lsn: PgLsn::from(begin.final_lsn()),
        }),
        LogicalReplicationMessage::Commit(commit) => Some(ChangeEvent::Commit {
            lsn: PgLsn::from(commit.end_lsn()),
        }),
        LogicalReplicationMessage::Relation(relation) => {
            let schema = decode_relation(&relation)?;
            relations.insert(relation.rel_id(), schema);
            None
        }
        LogicalReplicationMessage::Insert(insert) => {
            Some(decode_row(relations, lsn, insert.rel_id(), RowOp::Insert, |schema| {
                decode_tuple(schema, insert.tuple())
            })?)
        }
        LogicalReplicationMessage::Update(update) => {
            Some(decode_row(relations, lsn, update.rel_id(), RowOp::Update, |schema| {
                decode_tuple(schema, update.new_tuple())
            })?)
        }
        LogicalReplicationMessage::Delete(delete) => {
            Some(decode_row(relations, lsn, delete.rel_id(), RowOp::Delete, |schema| {
                let tuple = delete
                    .key_tuple()
                    .or_else(|| delete.old_tuple())
                    .ok_or_else(|| {
                        ConnectorError::Decode(
                            "delete event carries neither key nor old tuple; \
                             the table needs a replica identity"
                                .into(),
                        )
                    })?;
                decode_tuple(schema, tuple)
            })?)
        }
        LogicalReplicationMessage::Truncate(_) => {
            return Err(ConnectorError::Decode(
                "TRUNCATE on a captured table cannot be represented in the change stream".into(),
            ));
        }
        // origin and type metadata carry nothing we consume
        _ => None,
    };
    Ok(event)
}

fn decode_relation(relation: &RelationBody) -> ConnectorResult<RelationSchema> {
    let namespace = relation
        .namespace()
        .map_err(|e| ConnectorError::Decode(format!("bad relation namespace: {e}")))?
        .to_owned();
    let table = relation
        .name()
        .map_err(|e| ConnectorError::Decode(format!("bad relation name: {e}")))?
        .to_owned();
    let mut columns = Vec::with_capacity(relation.columns().len());
    for column in relation.columns() {
        let name = column
            .name()
            .map_err(|e| ConnectorError::Decode(format!("bad column name: {e}")))?
            .to_owned();
        columns.push((name, column.type_id() as u32));
    }
    Ok(RelationSchema {
        namespace,
        table,
        columns,
    })
}

fn decode_row(
    relations: &HashMap<u32, RelationSchema>,
    lsn: PgLsn,
    rel_id: u32,
    op: RowOp,
    fields: impl FnOnce(&RelationSchema) -> ConnectorResult<Map<String, Value>>,
) -> ConnectorResult<ChangeEvent> {
    let schema = relations.get(&rel_id).ok_or_else(|| {
        ConnectorError::Decode(format!("change for unknown relation id {rel_id}"))
    })?;
    Ok(ChangeEvent::Row(RowEvent {
        op,
        namespace: schema.namespace.clone(),
        table: schema.table.clone(),
        fields: fields(schema)?,
        lsn,
    }))
}

fn decode_tuple(
    schema: &RelationSchema,
    tuple: &Tuple,
) -> ConnectorResult<Map<String, Value>> {
    let data = tuple.tuple_data();
    if data.len() != schema.columns.len() {
        return Err(ConnectorError::Decode(format!(
            "tuple arity {} does not match relation {}.{} with {} columns",
            data.len(),
            schema.namespace,
            schema.table,
            schema.columns.len(),
        )));
    }
    let mut fields = Map::with_capacity(data.len());
    for ((name, type_oid), cell) in schema.columns.iter().zip(data) {
        match cell {
            TupleData::Null => {
                fields.insert(name.clone(), Value::Null);
            }
            // an unchanged TOAST value is simply absent from the event
            TupleData::UnchangedToast => {}
            TupleData::Text(raw) => {
                let text = std::str::from_utf8(raw).map_err(|e| {
                    ConnectorError::Decode(format!(
                        "non-utf8 text datum in column {name:?}: {e}"
                    ))
                })?;
                fields.insert(name.clone(), parser::translate_text(*type_oid, text));
            }
            #[allow(unreachable_patterns)]
            other => {
                return Err(ConnectorError::Decode(format!(
                    "unsupported datum encoding in column {name:?}: {other:?}"
                )));
            }
        }
    }
    Ok(fields)
}
