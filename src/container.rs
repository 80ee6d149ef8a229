// Copyright 2023 Greptime Team
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

//! The document container consumed by the stage.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::QuerySpec;
use crate::range::PartitionRange;
use crate::value::Value;

/// One document together with the sort-key values the server evaluated for
/// it and its rid.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByRow {
    pub payload: serde_json::Value,
    pub sort_values: Vec<Value>,
    pub rid: String,
}

/// Rid scan hints attached to a page by newer servers.
///
/// Older servers set only `reverse_rid_enabled`; newer servers also set
/// `reverse_index_scan`. Legacy servers attach no record at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExecutionInfo {
    #[serde(default)]
    pub reverse_rid_enabled: bool,
    #[serde(default)]
    pub reverse_index_scan: bool,
}

/// One locally sorted page returned by a partition.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<OrderByRow>,
    /// Continuation for the next page; absent when the partition is drained.
    pub next_token: Option<String>,
    pub execution_info: Option<QueryExecutionInfo>,
}

/// Outcome of a page fetch.
#[derive(Debug)]
pub enum FetchResponse {
    Page(Page),
    /// The partition key range was split away (HTTP 410 with the
    /// range-gone sub-status, decoded by the transport).
    Gone,
}

/// The external document container: issues one server round trip per page
/// and resolves split ranges to their children. Retries of transient
/// failures happen below this trait; a returned error is already final.
#[async_trait]
pub trait DocumentContainer: Send + Sync {
    async fn fetch_page(
        &self,
        range: &PartitionRange,
        query: &QuerySpec,
        server_token: Option<&str>,
        page_size: usize,
    ) -> Result<FetchResponse>;

    /// Child ranges of a range that reported [FetchResponse::Gone].
    async fn child_ranges(&self, range: &PartitionRange) -> Result<Vec<PartitionRange>>;
}

pub type DocumentContainerRef = Arc<dyn DocumentContainer>;
