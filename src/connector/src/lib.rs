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

//! Rivulet: a PostgreSQL change-data-capture connector.
//!
//! The connector emits one ordered stream of records that is the logical
//! union of a chunked backfill of every configured table and the logical
//! replication log from the moment capture started. The two sources are
//! merged by the watermark interleaver in [`capture`], which fences each
//! backfill cycle with a UUID written into a dedicated table so that the
//! merged output stays consistent and resumable.

pub mod capture;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod parser;
pub mod source;
pub mod state;
pub mod tuple;

pub use error::{ConnectorError, ConnectorResult};
