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

use thiserror::Error;

/// Fatal error classes of the connector. Nothing is recovered inside the
/// core; every error propagates to the process boundary and the outer
/// supervisor restarts from the last emitted checkpoint.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("replication decode error: {0}")]
    Decode(String),

    #[error("cannot translate column {column} of {table}: {reason}")]
    Translate {
        table: String,
        column: String,
        reason: String,
    },

    #[error("downstream emit failed: {0}")]
    Emit(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
