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

use serde::{Deserialize, Serialize};

use crate::state::{stream_id, StreamId};

/// Catalog returned by `discover`: every candidate stream supports
/// incremental sync with a source-defined cursor (the replication log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<DiscoveredStream>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredStream {
    pub namespace: String,
    pub name: String,
    /// Primary-key columns in key order; empty when the table has none.
    pub primary_key: Vec<String>,
    pub supported_sync_modes: Vec<String>,
    pub source_defined_cursor: bool,
}

impl DiscoveredStream {
    pub fn stream_id(&self) -> StreamId {
        stream_id(&self.namespace, &self.name)
    }
}

/// Catalog passed to `read`: the subset of streams to capture, with
/// optional per-stream overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub namespace: String,
    pub name: String,
    /// Overrides the table's primary key as the scan key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    /// Keep the stream in the catalog but skip it entirely.
    #[serde(default)]
    pub ignore: bool,
}

impl ConfiguredStream {
    pub fn stream_id(&self) -> StreamId {
        stream_id(&self.namespace, &self.name)
    }
}
