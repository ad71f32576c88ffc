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

//! Downstream message protocol: one JSON object per line on stdout.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::ConnectorResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Record(RecordMessage),
    State(StateMessage),
    Log(LogMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// `insert`, `update` or `delete`. Backfilled rows are inserts.
    pub op: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub emitted_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
}

impl Message {
    pub fn record(
        namespace: &str,
        stream: &str,
        op: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self::Record(RecordMessage {
            stream: stream.to_owned(),
            namespace: Some(namespace.to_owned()),
            op: op.to_owned(),
            data,
            emitted_at_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn state(data: serde_json::Value) -> Self {
        Self::State(StateMessage { data })
    }

    pub fn log(level: &str, message: impl Into<String>) -> Self {
        Self::Log(LogMessage {
            level: level.to_owned(),
            message: message.into(),
        })
    }
}

/// Downstream encoder seam. Writer failures are fatal: once an emit errors,
/// no further state may be checkpointed.
pub trait Emitter: Send {
    fn emit(&mut self, message: Message) -> ConnectorResult<()>;
}

/// Emits newline-delimited JSON to any writer, flushing each line so a
/// consumer never observes a torn message.
pub struct JsonLinesEmitter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl JsonLinesEmitter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Emitter for JsonLinesEmitter<W> {
    fn emit(&mut self, message: Message) -> ConnectorResult<()> {
        let line = serde_json::to_string(&message)
            .map_err(|e| anyhow::anyhow!("message serialization failed: {e}"))?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Collects messages in memory; the test double for the downstream encoder.
#[derive(Default)]
pub struct MemoryEmitter {
    pub messages: Vec<Message>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Emitter for MemoryEmitter {
    fn emit(&mut self, message: Message) -> ConnectorResult<()> {
        self.messages.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_line_shape() {
        let mut data = serde_json::Map::new();
        data.insert("id".to_owned(), serde_json::json!(1));
        let message = Message::Record(RecordMessage {
            stream: "orders".to_owned(),
            namespace: Some("public".to_owned()),
            op: "insert".to_owned(),
            data,
            emitted_at_ms: 1700000000000,
        });

        let mut buf = Vec::new();
        JsonLinesEmitter::new(&mut buf).emit(message).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\"type\":\"record\",\"stream\":\"orders\",\"namespace\":\"public\",\"op\":\"insert\",\"data\":{\"id\":1},\"emitted_at_ms\":1700000000000}\n"
        );
    }

    #[test]
    fn test_state_line_shape() {
        let mut buf = Vec::new();
        JsonLinesEmitter::new(&mut buf)
            .emit(Message::state(serde_json::json!({"current_log_position": "0/0"})))
            .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\"type\":\"state\",\"data\":{\"current_log_position\":\"0/0\"}}\n"
        );
    }
}
